//! The capability surface visible to tool code.
//!
//! A tool never touches the host directly. Everything it can ask for goes out
//! as an API_CALL through this module, and the host answers only the methods on
//! its allow-list. Local concerns (command registry, event listeners) never
//! leave the worker.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::channel::ChannelSender;
use crate::context::Disposable;
use crate::error::{Result, ToolHostError};
use crate::message::{Message, MessageType};
use crate::protocol::Protocol;
use crate::runtime::catch_plugin_panic;

// Host capability names. This list is mirrored by the host's allow-list.
pub const SHOW_NOTIFICATION: &str = "showNotification";
pub const COPY_TO_CLIPBOARD: &str = "copyToClipboard";
pub const SAVE_FILE: &str = "saveFile";
pub const GET_EVENT_HISTORY: &str = "getEventHistory";
pub const EMIT_EVENT: &str = "emitEvent";
pub const UPDATE_GLOBAL_STATE: &str = "updateGlobalState";

pub type CommandHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub type EventListener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[default]
    Info,
    Warning,
    Error,
}

/// Payload of `showNotification`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct NotificationOptions {
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

struct ApiInner {
    tool_id: String,
    sender: ChannelSender,
    protocol: Protocol,
    commands: DashMap<String, CommandHandler>,
    listeners: DashMap<String, Vec<(u64, EventListener)>>,
    next_listener: AtomicU64,
}

#[derive(Clone)]
pub struct ToolApi {
    inner: Arc<ApiInner>,
}

impl fmt::Debug for ToolApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolApi").field("tool_id", &self.inner.tool_id).finish()
    }
}

impl ToolApi {
    pub fn new(tool_id: impl Into<String>, sender: ChannelSender, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                tool_id: tool_id.into(),
                sender,
                protocol: Protocol::new(timeout),
                commands: DashMap::new(),
                listeners: DashMap::new(),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn tool_id(&self) -> &str {
        &self.inner.tool_id
    }

    pub fn commands(&self) -> Commands<'_> {
        Commands { api: self }
    }

    pub fn window(&self) -> Window<'_> {
        Window { api: self }
    }

    pub fn workspace(&self) -> Workspace<'_> {
        Workspace { api: self }
    }

    pub fn events(&self) -> Events<'_> {
        Events { api: self }
    }

    /// Issue an API_CALL to the host and wait for the correlated reply.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let sender = self.inner.sender.clone();
        self.inner
            .protocol
            .send(MessageType::ApiCall, &self.inner.tool_id, method, args, move |msg| {
                sender.send(msg)
            })
            .await
    }

    /// Feed a RESPONSE/ERROR from the host into the pending API calls.
    pub fn handle_response(&self, message: Message) -> bool {
        self.inner.protocol.handle_response(message)
    }

    /// Re-emit a host broadcast to every local listener of `name`.
    /// Returns how many listeners ran without panicking.
    pub fn dispatch_event(&self, name: &str, data: &Value) -> usize {
        let listeners: Vec<EventListener> = match self.inner.listeners.get(name) {
            Some(entry) => entry.iter().map(|(_, listener)| listener.clone()).collect(),
            None => return 0,
        };
        let mut delivered = 0;
        for listener in listeners {
            if catch_plugin_panic(|| listener(data)).is_ok() {
                delivered += 1;
            } else {
                warn!(tool_id = %self.inner.tool_id, event = name, "event listener panicked");
            }
        }
        delivered
    }

    /// Fail every outstanding API call; used when the channel goes away.
    pub fn dispose(&self) -> usize {
        self.inner.protocol.dispose()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.protocol.pending_count()
    }
}

// -----------------------------------------------------------------------------
// commands (in-process only)
// -----------------------------------------------------------------------------
pub struct Commands<'a> {
    api: &'a ToolApi,
}

impl Commands<'_> {
    /// Register a command handler; disposing the result unregisters it.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F) -> Disposable
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let handler: CommandHandler = Arc::new(move |args| handler(args).boxed());
        if self.api.inner.commands.insert(name.clone(), handler).is_some() {
            warn!(tool_id = %self.api.inner.tool_id, command = %name, "command re-registered");
        }
        let inner: Weak<ApiInner> = Arc::downgrade(&self.api.inner);
        Disposable::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.commands.remove(&name);
            }
            Ok(())
        })
    }

    pub async fn execute(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let handler = self
            .api
            .inner
            .commands
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ToolHostError::CommandNotFound(name.to_string()))?;
        Ok(handler(args).await?)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.api.inner.commands.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

// -----------------------------------------------------------------------------
// window: notifications and clipboard
// -----------------------------------------------------------------------------
pub struct Window<'a> {
    api: &'a ToolApi,
}

impl Window<'_> {
    /// Show a notification; resolves to the action the user picked, if any.
    pub async fn show_notification(&self, options: NotificationOptions) -> Result<Option<String>> {
        let result = self
            .api
            .call(SHOW_NOTIFICATION, vec![serde_json::to_value(options)?])
            .await?;
        Ok(result.as_str().map(str::to_string))
    }

    pub async fn show_information_message(&self, message: &str, actions: &[&str]) -> Result<Option<String>> {
        self.show(NotificationKind::Info, message, actions).await
    }

    pub async fn show_warning_message(&self, message: &str, actions: &[&str]) -> Result<Option<String>> {
        self.show(NotificationKind::Warning, message, actions).await
    }

    pub async fn show_error_message(&self, message: &str, actions: &[&str]) -> Result<Option<String>> {
        self.show(NotificationKind::Error, message, actions).await
    }

    pub async fn write_clipboard(&self, text: &str) -> Result<()> {
        self.api.call(COPY_TO_CLIPBOARD, vec![json!(text)]).await?;
        Ok(())
    }

    async fn show(&self, kind: NotificationKind, message: &str, actions: &[&str]) -> Result<Option<String>> {
        self.show_notification(NotificationOptions {
            kind,
            message: message.to_string(),
            title: None,
            actions: actions.iter().map(|a| a.to_string()).collect(),
        })
        .await
    }
}

// -----------------------------------------------------------------------------
// workspace
// -----------------------------------------------------------------------------
pub struct Workspace<'a> {
    api: &'a ToolApi,
}

impl Workspace<'_> {
    /// Ask the host to save `content`; `None` means the save was declined.
    pub async fn save_file(&self, path: &str, content: &str) -> Result<Option<String>> {
        let result = self.api.call(SAVE_FILE, vec![json!(path), json!(content)]).await?;
        Ok(result.as_str().map(str::to_string))
    }
}

// -----------------------------------------------------------------------------
// events: host broadcasts
// -----------------------------------------------------------------------------
pub struct Events<'a> {
    api: &'a ToolApi,
}

impl Events<'_> {
    /// Listen for a host-broadcast event. Disposing the result unsubscribes.
    pub fn on<F>(&self, name: impl Into<String>, listener: F) -> Disposable
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let name = name.into();
        let key = self.api.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.api
            .inner
            .listeners
            .entry(name.clone())
            .or_default()
            .push((key, Arc::new(listener)));
        debug!(tool_id = %self.api.inner.tool_id, event = %name, "listener added");

        let inner: Weak<ApiInner> = Arc::downgrade(&self.api.inner);
        Disposable::new(move || {
            if let Some(inner) = inner.upgrade() {
                if let Some(mut entry) = inner.listeners.get_mut(&name) {
                    entry.retain(|(k, _)| *k != key);
                }
                inner.listeners.remove_if(&name, |_, v| v.is_empty());
            }
            Ok(())
        })
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.api.inner.listeners.get(name).map(|l| l.len()).unwrap_or(0)
    }

    /// Publish an event through the host's event bus.
    pub async fn emit(&self, name: &str, data: Value) -> Result<()> {
        self.api.call(EMIT_EVENT, vec![json!(name), data]).await?;
        Ok(())
    }

    /// Recent host events, newest last.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<Value>> {
        let args = limit.map(|l| vec![json!(l)]).unwrap_or_default();
        match self.api.call(GET_EVENT_HISTORY, args).await? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(vec![]),
            other => Err(ToolHostError::InvalidArgs {
                method: GET_EVENT_HISTORY.to_string(),
                reason: format!("expected a list, got {other}"),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    pub(crate) fn test_api(tool_id: &str) -> (ToolApi, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let api = ToolApi::new(tool_id, ChannelSender::new(tx, tool_id), Duration::from_secs(5));
        (api, rx)
    }

    #[tokio::test]
    async fn commands_are_local() {
        let (api, mut sent) = test_api("t1");
        let registration = api
            .commands()
            .register("double", |args| async move {
                Ok(json!(args[0].as_i64().unwrap_or(0) * 2))
            });

        assert_eq!(api.commands().list(), vec!["double".to_string()]);
        assert_eq!(api.commands().execute("double", vec![json!(21)]).await.unwrap(), json!(42));
        assert!(sent.try_recv().is_err(), "commands must not touch the channel");

        registration.dispose().unwrap();
        let err = api.commands().execute("double", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "Command not found: double");
    }

    #[tokio::test]
    async fn window_calls_go_out_as_api_calls() {
        let (api, mut sent) = test_api("t1");
        let responder = api.clone();
        tokio::spawn(async move {
            let msg = sent.recv().await.unwrap();
            assert_eq!(msg.kind, MessageType::ApiCall);
            assert_eq!(msg.method_name(), SHOW_NOTIFICATION);
            assert_eq!(msg.args[0]["type"], "warning");
            assert_eq!(msg.args[0]["actions"], json!(["Retry"]));
            responder.handle_response(Message::response(&msg.id, "t1", json!("Retry")));
        });

        let picked = api
            .window()
            .show_warning_message("disk almost full", &["Retry"])
            .await
            .unwrap();
        assert_eq!(picked.as_deref(), Some("Retry"));
    }

    #[tokio::test]
    async fn host_error_rejects_the_call() {
        let (api, mut sent) = test_api("t1");
        let responder = api.clone();
        tokio::spawn(async move {
            let msg = sent.recv().await.unwrap();
            responder.handle_response(Message::error(&msg.id, "t1", "Unknown API method: saveFile"));
        });
        let err = api.workspace().save_file("a.txt", "x").await.unwrap_err();
        assert!(err.to_string().contains("Unknown API method"));
    }

    #[test]
    fn every_listener_receives_the_event() {
        let (api, _sent) = test_api("t1");
        let hits = Arc::new(AtomicUsize::new(0));
        let a = hits.clone();
        let b = hits.clone();
        let first = api.events().on("theme", move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let _second = api.events().on("theme", move |data| {
            assert_eq!(data, &json!("dark"));
            b.fetch_add(10, Ordering::SeqCst);
        });

        assert_eq!(api.dispatch_event("theme", &json!("dark")), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        first.dispose().unwrap();
        assert_eq!(api.events().listener_count("theme"), 1);
        assert_eq!(api.dispatch_event("theme", &json!("dark")), 1);
        assert_eq!(api.dispatch_event("other", &Value::Null), 0);
    }

    #[tokio::test]
    async fn dispose_fails_outstanding_calls() {
        let (api, mut sent) = test_api("t1");
        let caller = api.clone();
        let call = tokio::spawn(async move { caller.events().emit("x", json!(1)).await });
        sent.recv().await.unwrap();
        assert_eq!(api.dispose(), 1);
        assert!(matches!(call.await.unwrap(), Err(ToolHostError::Disposed(_))));
    }
}
