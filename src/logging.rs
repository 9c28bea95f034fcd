//! Tracing initialisation for the gateway.
//!
//! The daemon logs on two layers: a daily-rotated JSON file under the data
//! directory, with the file stem carrying the instance id so several
//! gateways can share one logs directory, and a human-readable stderr layer.
//! Both are filtered by `RUST_LOG` (default `info`). One-shot subcommands
//! get the stderr layer only.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive; dropping it flushes whatever is
/// buffered and stops file logging, so it must live as long as the process.
#[must_use = "dropping the guard flushes and stops file logging"]
pub struct LoggingGuard {
    _file_writer: Option<WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Full daemon logging: `{logs_dir}/{instance_id}.log.YYYY-MM-DD` in JSON
/// plus stderr for humans.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_daemon(logs_dir: &Path, instance_id: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let appender = tracing_appender::rolling::daily(logs_dir, format!("{instance_id}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json().with_writer(file_writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard {
        _file_writer: Some(guard),
    })
}

/// Stderr-only logging for `check-config` and other one-shot commands.
pub fn init_cli() -> LoggingGuard {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    LoggingGuard { _file_writer: None }
}
