// src/events.rs

use serde::Serialize;
use serde_json::Value;
use tool_plugin::Message;

/// What the host tells the outside world (UI, settings, the CLI).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostEvent {
    Loaded { tool_id: String },
    Unloaded { tool_id: String, reason: UnloadReason },
    Activated { tool_id: String },
    Deactivated { tool_id: String },
    Error { tool_id: String, error: String },
    ToolEvent { tool_id: String, name: String, data: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadReason {
    Requested,
    Exited,
}

impl HostEvent {
    pub fn tool_id(&self) -> &str {
        match self {
            HostEvent::Loaded { tool_id }
            | HostEvent::Unloaded { tool_id, .. }
            | HostEvent::Activated { tool_id }
            | HostEvent::Deactivated { tool_id }
            | HostEvent::Error { tool_id, .. }
            | HostEvent::ToolEvent { tool_id, .. } => tool_id,
        }
    }
}

// -----------------------------------------------------------------------------
// Supervisor → host queues, one per concern
// -----------------------------------------------------------------------------

/// Lifecycle changes of one worker process.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Activated,
    Deactivated,
    /// Something went wrong that did not (yet) end the process.
    Error(String),
    /// The process is gone. `expected` is true when `stop()` caused it.
    Exited { code: Option<i32>, expected: bool },
}

/// An API_CALL the worker issued; the host answers through `send_message`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub tool_id: String,
    pub message: Message,
}

/// An EVENT the worker emitted on its own initiative (anything but `ready`).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolEvent {
    pub tool_id: String,
    pub name: String,
    pub data: Value,
}
