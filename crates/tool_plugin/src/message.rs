use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, ToolHostError};

/// Method carried by the readiness handshake event.
pub const READY_EVENT: &str = "ready";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Request,
    Response,
    Error,
    Event,
    Activate,
    Deactivate,
    ApiCall,
}

impl MessageType {
    /// Kinds that settle a pending request.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

/// The envelope of every message exchanged between a supervisor and its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Producer wall clock in milliseconds. Advisory only.
    pub timestamp: i64,
}

// -----------------------------------------------------------------------------
// Constructors
// -----------------------------------------------------------------------------
impl Message {
    fn base(kind: MessageType, id: String, tool_id: &str) -> Self {
        Self {
            kind,
            id,
            tool_id: tool_id.to_string(),
            method: None,
            args: vec![],
            result: None,
            error: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// A fresh call of `kind` (REQUEST, ACTIVATE, DEACTIVATE or API_CALL) with a new id.
    pub fn call(kind: MessageType, tool_id: &str, method: &str, args: Vec<Value>) -> Self {
        let mut message = Self::base(kind, new_id(), tool_id);
        message.method = Some(method.to_string());
        message.args = args;
        message
    }

    pub fn response(id: &str, tool_id: &str, result: Value) -> Self {
        let mut message = Self::base(MessageType::Response, id.to_string(), tool_id);
        message.result = Some(result);
        message
    }

    pub fn error(id: &str, tool_id: &str, error: impl Into<String>) -> Self {
        let mut message = Self::base(MessageType::Error, id.to_string(), tool_id);
        message.error = Some(error.into());
        message
    }

    pub fn event(tool_id: &str, name: &str, args: Vec<Value>) -> Self {
        let mut message = Self::base(MessageType::Event, new_id(), tool_id);
        message.method = Some(name.to_string());
        message.args = args;
        message
    }

    /// The handshake a worker sends once its channel is up.
    pub fn ready(tool_id: &str) -> Self {
        Self::event(tool_id, READY_EVENT, vec![])
    }

    pub fn method_name(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }

    pub fn is_ready_event(&self) -> bool {
        self.kind == MessageType::Event && self.method.as_deref() == Some(READY_EVENT)
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// -----------------------------------------------------------------------------
// Trust boundary
// -----------------------------------------------------------------------------

/// Structural check run before any field of an inbound value is trusted.
pub fn validate_message(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("type").is_some_and(Value::is_string)
        && obj.get("id").is_some_and(Value::is_string)
        && obj.get("toolId").is_some_and(Value::is_string)
        && obj.get("timestamp").is_some_and(Value::is_number)
}

/// Validate and decode an inbound value.
pub fn parse_message(value: Value) -> Result<Message> {
    if !validate_message(&value) {
        return Err(ToolHostError::Json(format!("malformed message: {value}")));
    }
    Ok(serde_json::from_value(value)?)
}

/// Decode one line from the wire; malformed input is logged and dropped.
pub fn decode_line(line: &str) -> Option<Message> {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(err) => {
            warn!("Dropping unparseable channel line: {err}");
            return None;
        }
    };
    match parse_message(value) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!("Dropping invalid message: {err}");
            None
        }
    }
}
