use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Keeps the file writer flushing; drop it only at shutdown.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the host subscriber: stderr always, plus a daily `toolhost.log`
/// under `log_dir` when one is configured. `RUST_LOG` wins over `log_level`.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<LogGuard> {
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.to_string());

    // ── console ─────────────────────────────────────────────────────
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(&directive));

    // ── optional rolling file ───────────────────────────────────────
    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "toolhost.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new(&directive));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default().with(console).with(file).try_init()?;
    Ok(LogGuard { _file: guard })
}
