use std::{env, path::PathBuf, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_API_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_EVENT_HISTORY_LIMIT: usize = 100;

/// Host-wide settings. Timeouts are kept in milliseconds so the config
/// serializes to something a person can edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ToolHostConfig {
    /// Window for host → worker calls (activate, deactivate, commands).
    pub request_timeout_ms: u64,
    /// How long a freshly spawned worker has to send `ready`.
    pub handshake_timeout_ms: u64,
    /// Window for worker → host API calls, passed to each worker.
    pub api_call_timeout_ms: u64,
    pub tools_dir: PathBuf,
    /// Where `saveFile` may write.
    pub output_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub event_history_limit: usize,
}

impl Default for ToolHostConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            api_call_timeout_ms: DEFAULT_API_CALL_TIMEOUT_MS,
            tools_dir: PathBuf::from("tools"),
            output_dir: PathBuf::from("output"),
            log_dir: None,
            log_level: "info".to_string(),
            event_history_limit: DEFAULT_EVENT_HISTORY_LIMIT,
        }
    }
}

impl ToolHostConfig {
    /// Defaults overlaid with `TOOL_HOST_*` variables, after loading `.env`.
    pub fn from_env() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded .env from {}", path.display()),
            Err(err) if err.not_found() => {}
            Err(err) => warn!("could not load .env: {err}"),
        }
        Self::default().overlay(|key| env::var(key).ok())
    }

    /// Apply overrides from `lookup`; unparseable numbers are logged and ignored.
    pub fn overlay<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!("ignoring {key}={raw}: not a number");
                    None
                }
            }
        };

        if let Some(ms) = number("TOOL_HOST_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = ms;
        }
        if let Some(ms) = number("TOOL_HOST_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = ms;
        }
        if let Some(ms) = number("TOOL_HOST_API_CALL_TIMEOUT_MS") {
            self.api_call_timeout_ms = ms;
        }
        if let Some(limit) = number("TOOL_HOST_EVENT_HISTORY_LIMIT") {
            self.event_history_limit = limit as usize;
        }
        if let Some(dir) = lookup("TOOL_HOST_TOOLS_DIR") {
            self.tools_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("TOOL_HOST_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("TOOL_HOST_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("TOOL_HOST_LOG_LEVEL") {
            self.log_level = level;
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn api_call_timeout(&self) -> Duration {
        Duration::from_millis(self.api_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_windows() {
        let config = ToolHostConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.api_call_timeout(), Duration::from_secs(30));
        assert_eq!(config.event_history_limit, 100);
    }

    #[test]
    fn overlay_applies_known_keys() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TOOL_HOST_REQUEST_TIMEOUT_MS", "250"),
            ("TOOL_HOST_HANDSHAKE_TIMEOUT_MS", "oops"),
            ("TOOL_HOST_TOOLS_DIR", "/opt/tools"),
            ("TOOL_HOST_LOG_LEVEL", "debug"),
        ]);
        let config = ToolHostConfig::default().overlay(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT_MS);
        assert_eq!(config.tools_dir, PathBuf::from("/opt/tools"));
        assert_eq!(config.log_level, "debug");
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ToolHostConfig = serde_json::from_str(r#"{"request_timeout_ms": 5}"#).unwrap();
        assert_eq!(config.request_timeout_ms, 5);
        assert_eq!(config.api_call_timeout_ms, DEFAULT_API_CALL_TIMEOUT_MS);
    }
}
