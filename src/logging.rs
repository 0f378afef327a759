//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Two modes:
//! - **Production** ([`init_production`]): optional JSON file layer (daily
//!   rotation) plus a console layer, driven by `telemetry.*` config.
//! - **CLI** ([`init_cli`]): console-only, for one-shot subcommands.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::TelemetryConfig;

/// Holds the non-blocking writer guard for file logging.
///
/// The [`WorkerGuard`] must be kept alive for the duration of the process.
/// Dropping it flushes pending log entries and closes the file.
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

/// Initialise logging for server startup (production mode).
///
/// When `telemetry.logs_dir` is set, writes daily-rotated logs to
/// `{logs_dir}/llmproxy.log.YYYY-MM-DD` in JSON or human-readable format per
/// `telemetry.json`. Always emits to stderr as well, controlled by
/// `telemetry.log_filter` unless `RUST_LOG` is set.
///
/// Returns a [`LoggingGuard`] that must be kept alive for log flushing.
///
/// # Errors
///
/// Returns an error if the logs directory is configured but cannot be created.
pub fn init_production(telemetry: &TelemetryConfig) -> anyhow::Result<LoggingGuard> {
    let console_layer: Box<dyn Layer<Registry> + Send + Sync> = if telemetry.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    let Some(logs_dir) = &telemetry.logs_dir else {
        tracing_subscriber::registry()
            .with(env_filter(&telemetry.log_filter))
            .with(console_layer)
            .init();
        return Ok(LoggingGuard { _guard: None });
    };

    let dir = Path::new(logs_dir);
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("failed to create logs directory {}: {e}", dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(dir, "llmproxy.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter(&telemetry.log_filter))
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard {
        _guard: Some(guard),
    })
}

/// Initialise minimal logging for CLI subcommands. Emits human-readable
/// output to stderr only. No file rotation. Controlled by `RUST_LOG`
/// (default: `info`).
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .init();
}
