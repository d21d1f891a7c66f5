// src/host.rs

use std::{
    fmt,
    sync::{Arc, Weak},
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use tool_plugin::{
    Message, NotificationOptions, ToolHostError,
    api::{COPY_TO_CLIPBOARD, EMIT_EVENT, GET_EVENT_HISTORY, SAVE_FILE, SHOW_NOTIFICATION, UPDATE_GLOBAL_STATE},
    error::Result,
};

use crate::config::ToolHostConfig;
use crate::events::{ApiCall, HostEvent, LifecycleEvent, ToolEvent, UnloadReason};
use crate::services::{HostServices, LocalServices};
use crate::supervisor::{SupervisorEvents, SupervisorOptions, ToolProcess, ToolState};
use crate::tool::Tool;

const EVENT_BUFFER: usize = 256;

struct ToolHostEntry {
    tool: Tool,
    process: Arc<ToolProcess>,
}

/// Snapshot of one loaded tool, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStatus {
    pub id: String,
    pub name: String,
    pub version: String,
    pub state: String,
    pub active: bool,
}

struct HostInner {
    config: ToolHostConfig,
    services: Arc<dyn HostServices>,
    tools: DashMap<String, ToolHostEntry>,
    events: broadcast::Sender<HostEvent>,
}

/// Owns every running tool and answers their API calls.
#[derive(Clone)]
pub struct ToolHost {
    inner: Arc<HostInner>,
}

impl fmt::Debug for ToolHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.inner.tools.iter().map(|kv| kv.key().clone()).collect();
        f.debug_struct("ToolHost").field("tools", &ids).finish()
    }
}

impl ToolHost {
    pub fn new(config: ToolHostConfig, services: Arc<dyn HostServices>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(HostInner { config, services, tools: DashMap::new(), events }),
        }
    }

    /// A host backed by [`LocalServices`] rooted at `config.output_dir`.
    pub fn with_local_services(config: ToolHostConfig) -> Self {
        let services = Arc::new(LocalServices::new(config.output_dir.clone(), config.event_history_limit));
        Self::new(config, services)
    }

    pub fn config(&self) -> &ToolHostConfig {
        &self.inner.config
    }

    /// Host events for whoever wants them (UI, persistence, the CLI).
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_loaded(&self, tool_id: &str) -> bool {
        self.inner.tools.contains_key(tool_id)
    }

    pub fn is_active(&self, tool_id: &str) -> bool {
        self.process(tool_id).is_some_and(|p| p.is_active())
    }

    pub fn list_tools(&self) -> Vec<ToolStatus> {
        let mut tools: Vec<ToolStatus> = self
            .inner
            .tools
            .iter()
            .map(|kv| {
                let entry = kv.value();
                let state = entry.process.state();
                ToolStatus {
                    id: entry.tool.id.clone(),
                    name: entry.tool.name.clone(),
                    version: entry.tool.version.clone(),
                    state: state.to_string(),
                    active: state == ToolState::Active,
                }
            })
            .collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }

    fn process(&self, tool_id: &str) -> Option<Arc<ToolProcess>> {
        self.inner.tools.get(tool_id).map(|entry| entry.process.clone())
    }

    fn loaded(&self, tool_id: &str) -> Result<Arc<ToolProcess>> {
        self.process(tool_id)
            .ok_or_else(|| ToolHostError::NotLoaded(tool_id.to_string()))
    }

    fn publish(&self, event: HostEvent) {
        debug!(tool_id = %event.tool_id(), ?event, "host event");
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Spawn the tool's worker and wait for its handshake.
    /// Loading an id that is already present only logs a warning.
    pub async fn load_tool(&self, tool: Tool) -> Result<()> {
        let tool_id = tool.id.clone();
        if self.is_loaded(&tool_id) {
            warn!(%tool_id, "tool already loaded");
            return Ok(());
        }

        let (process, events) = ToolProcess::new(tool.clone(), SupervisorOptions::from(&self.inner.config));
        let process = Arc::new(process);
        self.route(process.clone(), events);

        if let Err(err) = process.start().await {
            error!(%tool_id, "could not load tool: {err}");
            self.publish(HostEvent::Error { tool_id, error: err.to_string() });
            return Err(err);
        }

        let inserted = match self.inner.tools.entry(tool_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ToolHostEntry { tool, process: process.clone() });
                true
            }
        };
        if !inserted {
            warn!(%tool_id, "tool loaded concurrently, discarding duplicate");
            let _ = process.stop().await;
            return Ok(());
        }
        info!(%tool_id, "tool loaded");
        self.publish(HostEvent::Loaded { tool_id });
        Ok(())
    }

    /// Load several tools concurrently. Returns the ones that failed.
    pub async fn load_tools(&self, tools: Vec<Tool>) -> Vec<(String, ToolHostError)> {
        let loads = tools.into_iter().map(|tool| {
            let host = self.clone();
            async move {
                let id = tool.id.clone();
                host.load_tool(tool).await.err().map(|err| (id, err))
            }
        });
        join_all(loads).await.into_iter().flatten().collect()
    }

    pub async fn activate_tool(&self, tool_id: &str) -> Result<()> {
        self.loaded(tool_id)?.activate().await
    }

    pub async fn deactivate_tool(&self, tool_id: &str) -> Result<()> {
        self.loaded(tool_id)?.deactivate().await
    }

    /// Stop the tool and forget it. Unknown ids are ignored.
    pub async fn unload_tool(&self, tool_id: &str) -> Result<()> {
        let Some(process) = self.process(tool_id) else {
            return Ok(());
        };
        process.stop().await?;
        let removed = self
            .inner
            .tools
            .remove_if(tool_id, |_, entry| Arc::ptr_eq(&entry.process, &process))
            .is_some();
        if removed {
            info!(%tool_id, "tool unloaded");
            self.publish(HostEvent::Unloaded { tool_id: tool_id.to_string(), reason: UnloadReason::Requested });
        }
        Ok(())
    }

    /// Invoke a command the tool exports.
    pub async fn execute_command(&self, tool_id: &str, command: &str, args: Vec<Value>) -> Result<Value> {
        self.loaded(tool_id)?.call_api(command, args).await
    }

    /// Send an EVENT to every loaded worker. Returns how many got it.
    pub fn broadcast_event(&self, name: &str, data: Value) -> usize {
        let targets: Vec<(String, Arc<ToolProcess>)> = self
            .inner
            .tools
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().process.clone()))
            .collect();
        let mut delivered = 0;
        for (tool_id, process) in targets {
            match process.send_message(Message::event(&tool_id, name, vec![data.clone()])) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(%tool_id, event = name, "broadcast skipped: {err}"),
            }
        }
        delivered
    }

    /// Unload everything concurrently.
    pub async fn dispose(&self) {
        let ids: Vec<String> = self.inner.tools.iter().map(|kv| kv.key().clone()).collect();
        info!(count = ids.len(), "disposing tool host");
        let unloads = ids.iter().map(|id| self.unload_tool(id));
        for (id, outcome) in ids.iter().zip(join_all(unloads).await) {
            if let Err(err) = outcome {
                warn!(tool_id = %id, "unload failed: {err}");
            }
        }
    }

    // ── supervisor queues ───────────────────────────────────────────

    /// Drain a supervisor's three queues. The tasks hold only a weak handle
    /// and end when the supervisor drops its senders.
    fn route(&self, process: Arc<ToolProcess>, events: SupervisorEvents) {
        let SupervisorEvents { mut lifecycle, mut api_calls, mut tool_events } = events;
        let tool_id = process.tool_id().to_string();
        let weak: Weak<HostInner> = Arc::downgrade(&self.inner);
        let watched: Weak<ToolProcess> = Arc::downgrade(&process);

        {
            let weak = weak.clone();
            let watched = watched.clone();
            tokio::spawn(async move {
                while let Some(event) = lifecycle.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    let host = ToolHost { inner };
                    match event {
                        LifecycleEvent::Activated => host.publish(HostEvent::Activated { tool_id: tool_id.clone() }),
                        LifecycleEvent::Deactivated => {
                            host.publish(HostEvent::Deactivated { tool_id: tool_id.clone() })
                        }
                        LifecycleEvent::Error(error) => host.publish(HostEvent::Error { tool_id: tool_id.clone(), error }),
                        LifecycleEvent::Exited { expected: true, .. } => {}
                        LifecycleEvent::Exited { code, expected: false } => {
                            host.handle_exit(&tool_id, &watched, code);
                        }
                    }
                }
            });
        }
        {
            let weak = weak.clone();
            tokio::spawn(async move {
                while let Some(ApiCall { tool_id, message }) = api_calls.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    let Some(origin) = watched.upgrade() else {
                        debug!(%tool_id, "tool gone before its API call was answered");
                        break;
                    };
                    let host = ToolHost { inner };
                    tokio::spawn(async move { host.handle_tool_api_call(&origin, message).await });
                }
            });
        }
        tokio::spawn(async move {
            while let Some(ToolEvent { tool_id, name, data }) = tool_events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                ToolHost { inner }.publish(HostEvent::ToolEvent { tool_id, name, data });
            }
        });
    }

    /// The worker died on its own. Drop its entry; other tools carry on.
    fn handle_exit(&self, tool_id: &str, watched: &Weak<ToolProcess>, code: Option<i32>) {
        let removed = self
            .inner
            .tools
            .remove_if(tool_id, |_, entry| {
                watched.upgrade().is_some_and(|p| Arc::ptr_eq(&entry.process, &p))
            })
            .is_some();
        if !removed {
            return;
        }
        let reason = match code {
            Some(code) => format!("Tool {tool_id} exited unexpectedly with code {code}"),
            None => format!("Tool {tool_id} was terminated"),
        };
        error!(%tool_id, "{reason}");
        self.publish(HostEvent::Error { tool_id: tool_id.to_string(), error: reason });
        self.publish(HostEvent::Unloaded { tool_id: tool_id.to_string(), reason: UnloadReason::Exited });
    }

    // ── capability boundary ─────────────────────────────────────────

    /// Answer an API_CALL from a worker. Never fails outward: every outcome
    /// goes back to the worker as a RESPONSE or ERROR carrying the call's id.
    ///
    /// The reply goes back through `origin`, the supervisor whose worker made
    /// the call, even if the id has since been reloaded under a new one.
    pub async fn handle_tool_api_call(&self, origin: &ToolProcess, message: Message) {
        let tool_id = origin.tool_id();
        let reply = match self.dispatch_api(tool_id, &message).await {
            Ok(result) => Message::response(&message.id, tool_id, result),
            Err(err) => {
                debug!(%tool_id, method = message.method_name(), "API call refused: {err}");
                Message::error(&message.id, tool_id, err.to_string())
            }
        };
        if let Err(err) = origin.send_message(reply) {
            warn!(%tool_id, "could not answer API call: {err}");
        }
    }

    async fn dispatch_api(&self, tool_id: &str, message: &Message) -> Result<Value> {
        let services = &self.inner.services;
        let method = message.method_name();
        let args = &message.args;

        match method {
            SHOW_NOTIFICATION => {
                let options: NotificationOptions = serde_json::from_value(arg(method, args, 0)?.clone())
                    .map_err(|e| invalid(method, e.to_string()))?;
                let picked = services.show_notification(tool_id, options).await?;
                Ok(json!(picked))
            }
            COPY_TO_CLIPBOARD => {
                services.copy_to_clipboard(tool_id, str_arg(method, args, 0)?).await?;
                Ok(Value::Null)
            }
            SAVE_FILE => {
                let path = str_arg(method, args, 0)?;
                let content = str_arg(method, args, 1)?;
                Ok(json!(services.save_file(tool_id, path, content).await?))
            }
            GET_EVENT_HISTORY => {
                let limit = match args.first() {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(v.as_u64().ok_or_else(|| invalid(method, "limit must be a number"))? as usize),
                };
                Ok(Value::Array(services.get_event_history(tool_id, limit).await?))
            }
            EMIT_EVENT => {
                let name = str_arg(method, args, 0)?.to_string();
                let data = args.get(1).cloned().unwrap_or(Value::Null);
                services.emit_event(tool_id, &name, data.clone()).await?;
                self.publish(HostEvent::ToolEvent { tool_id: tool_id.to_string(), name: name.clone(), data: data.clone() });
                let delivered = self.broadcast_event(&name, data);
                debug!(%tool_id, event = %name, delivered, "event fanned out");
                Ok(Value::Null)
            }
            UPDATE_GLOBAL_STATE => {
                let key = str_arg(method, args, 0)?;
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                services.update_global_state(tool_id, key, value).await?;
                Ok(Value::Null)
            }
            other => {
                warn!(%tool_id, method = other, "tool asked for a capability it does not have");
                Err(ToolHostError::UnknownApiMethod(other.to_string()))
            }
        }
    }
}

fn invalid(method: &str, reason: impl Into<String>) -> ToolHostError {
    ToolHostError::InvalidArgs { method: method.to_string(), reason: reason.into() }
}

fn arg<'a>(method: &str, args: &'a [Value], index: usize) -> Result<&'a Value> {
    args.get(index)
        .ok_or_else(|| invalid(method, format!("missing argument {index}")))
}

fn str_arg<'a>(method: &str, args: &'a [Value], index: usize) -> Result<&'a str> {
    arg(method, args, index)?
        .as_str()
        .ok_or_else(|| invalid(method, format!("argument {index} must be a string")))
}
