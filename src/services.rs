//! Concrete host capabilities behind the API allow-list.

use std::{
    collections::VecDeque,
    path::{Component, Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tool_plugin::{NotificationKind, NotificationOptions};
use tracing::{debug, error, info, warn};

/// The six operations a tool may reach. Adding a capability means adding a
/// method here and an explicit arm in the host's dispatcher.
#[async_trait]
pub trait HostServices: Send + Sync {
    /// Returns the action the user picked, if any.
    async fn show_notification(&self, tool_id: &str, options: NotificationOptions) -> Result<Option<String>>;
    async fn copy_to_clipboard(&self, tool_id: &str, text: &str) -> Result<()>;
    /// Returns where the file ended up, or `None` if the save was declined.
    async fn save_file(&self, tool_id: &str, path: &str, content: &str) -> Result<Option<String>>;
    /// Most recent events, newest last.
    async fn get_event_history(&self, tool_id: &str, limit: Option<usize>) -> Result<Vec<Value>>;
    async fn emit_event(&self, tool_id: &str, name: &str, data: Value) -> Result<()>;
    async fn update_global_state(&self, tool_id: &str, key: &str, value: Value) -> Result<()>;
}

/// Headless services: notifications go to the log, the clipboard and global
/// state live in memory, saved files land under `output_dir`.
#[derive(Debug)]
pub struct LocalServices {
    output_dir: PathBuf,
    history_limit: usize,
    history: Mutex<VecDeque<Value>>,
    clipboard: Mutex<Option<String>>,
    notifications: Mutex<Vec<(String, NotificationOptions)>>,
    global_state: DashMap<String, DashMap<String, Value>>,
}

impl LocalServices {
    pub fn new(output_dir: impl Into<PathBuf>, history_limit: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            history_limit: history_limit.max(1),
            history: Mutex::new(VecDeque::new()),
            clipboard: Mutex::new(None),
            notifications: Mutex::new(vec![]),
            global_state: DashMap::new(),
        }
    }

    pub fn clipboard(&self) -> Option<String> {
        self.clipboard.lock().ok().and_then(|c| c.clone())
    }

    pub fn notifications(&self) -> Vec<(String, NotificationOptions)> {
        self.notifications.lock().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn global_state(&self, tool_id: &str, key: &str) -> Option<Value> {
        self.global_state
            .get(tool_id)
            .and_then(|state| state.get(key).map(|v| v.value().clone()))
    }

    fn resolve_output(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.trim().is_empty() {
            bail!("saveFile needs a file name");
        }
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("saveFile path must stay inside the output directory: {path}");
        }
        Ok(self.output_dir.join(relative))
    }
}

#[async_trait]
impl HostServices for LocalServices {
    async fn show_notification(&self, tool_id: &str, options: NotificationOptions) -> Result<Option<String>> {
        let title = options.title.as_deref().unwrap_or(tool_id);
        match options.kind {
            NotificationKind::Info => info!(%tool_id, %title, actions = ?options.actions, "{}", options.message),
            NotificationKind::Warning => warn!(%tool_id, %title, actions = ?options.actions, "{}", options.message),
            NotificationKind::Error => error!(%tool_id, %title, actions = ?options.actions, "{}", options.message),
        }
        if let Ok(mut log) = self.notifications.lock() {
            log.push((tool_id.to_string(), options));
        }
        // nobody is there to click
        Ok(None)
    }

    async fn copy_to_clipboard(&self, tool_id: &str, text: &str) -> Result<()> {
        debug!(%tool_id, len = text.len(), "clipboard updated");
        let mut clipboard = self.clipboard.lock().map_err(|_| anyhow!("clipboard lock poisoned"))?;
        *clipboard = Some(text.to_string());
        Ok(())
    }

    async fn save_file(&self, tool_id: &str, path: &str, content: &str) -> Result<Option<String>> {
        let target = self.resolve_output(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        info!(%tool_id, "saved {}", target.display());
        Ok(Some(target.to_string_lossy().into_owned()))
    }

    async fn get_event_history(&self, _tool_id: &str, limit: Option<usize>) -> Result<Vec<Value>> {
        let history = self.history.lock().map_err(|_| anyhow!("history lock poisoned"))?;
        let take = limit.unwrap_or(history.len()).min(history.len());
        Ok(history.iter().skip(history.len() - take).cloned().collect())
    }

    async fn emit_event(&self, tool_id: &str, name: &str, data: Value) -> Result<()> {
        let mut history = self.history.lock().map_err(|_| anyhow!("history lock poisoned"))?;
        history.push_back(json!({
            "name": name,
            "toolId": tool_id,
            "data": data,
            "timestamp": Utc::now().timestamp_millis(),
        }));
        while history.len() > self.history_limit {
            history.pop_front();
        }
        Ok(())
    }

    async fn update_global_state(&self, tool_id: &str, key: &str, value: Value) -> Result<()> {
        let state = self.global_state.entry(tool_id.to_string()).or_default();
        if value.is_null() {
            state.remove(key);
        } else {
            state.insert(key.to_string(), value);
        }
        Ok(())
    }
}
