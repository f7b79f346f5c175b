//! Logging initialization for relay processes.
//!
//! Relay logs go to `<base>/logs/relay.jsonl` as structured JSONL through the
//! observability package. `RUST_LOG` overrides the configured level.

use crate::CoreResult;
use std::path::PathBuf;

/// Service name written into every log line.
pub const SERVICE_NAME: &str = "outbox-relay";

/// Initialize the logging system.
///
/// * `level` - Default log level (trace, debug, info, warn, error)
/// * `log_path` - JSONL file to append to
/// * `also_stderr` - Mirror logs to stderr (foreground runs)
pub fn init_logging(level: &str, log_path: PathBuf, also_stderr: bool) -> CoreResult<PathBuf> {
    let path = observability::init_with_config(observability::LogConfig {
        service_name: SERVICE_NAME.into(),
        default_level: level.into(),
        log_path: Some(log_path),
        also_stderr,
        stderr_level: level.into(),
    })?;
    Ok(path)
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
