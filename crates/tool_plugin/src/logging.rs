// crates/tool_plugin/src/logging.rs

use std::{env, path::PathBuf};

use tracing_appender::rolling::daily;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

/// Level directive passed down from the host, e.g. `info` or `tool_plugin=debug`.
pub const LOG_LEVEL_ENV: &str = "TOOL_HOST_LOG_LEVEL";
/// When set, workers also write a daily-rotated `<tool_id>.log` here.
pub const LOG_DIR_ENV: &str = "TOOL_HOST_LOG_DIR";

/// Install the worker's subscriber.
///
/// Everything goes to stderr, which the host forwards into its own log. The
/// channel has its own socket, so nothing here can corrupt the protocol.
/// Safe to call twice; the second call is a no-op.
pub fn init_worker_tracing() {
    let level = filter_directive(|key| env::var(key).ok());
    let tool_id = env::var(crate::runtime::TOOL_ID_ENV).unwrap_or_else(|_| "tool".to_string());

    // ── stderr ──────────────────────────────────────────────────────
    let stderr_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(&level));

    // ── optional file ───────────────────────────────────────────────
    let file_layer = env::var(LOG_DIR_ENV).ok().map(PathBuf::from).and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        let appender = daily(dir, format!("{tool_id}.log"));
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(EnvFilter::new(&level)),
        )
    });

    let _ = Registry::default()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

/// `RUST_LOG` wins over the level the host passed down.
fn filter_directive<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let set = |key: &str| lookup(key).filter(|directive| !directive.trim().is_empty());
    set("RUST_LOG")
        .or_else(|| set(LOG_LEVEL_ENV))
        .unwrap_or_else(|| "info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn rust_log_overrides_host_level() {
        let vars = lookup(&[("RUST_LOG", "tool_plugin=trace"), (LOG_LEVEL_ENV, "warn")]);
        assert_eq!(filter_directive(vars), "tool_plugin=trace");
    }

    #[test]
    fn falls_back_to_host_level_then_info() {
        assert_eq!(filter_directive(lookup(&[(LOG_LEVEL_ENV, "debug")])), "debug");
        assert_eq!(filter_directive(lookup(&[])), "info");
    }
}
