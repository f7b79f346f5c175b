//! # Observability
//!
//! Structured logging for the outbox relay processes.
//!
//! Every process calls [`init_with_config`] once at startup and then logs
//! through the standard `tracing` macros. Events are written as one JSON
//! object per line to an append-only file (`~/.outbox-relay/logs/relay.jsonl`
//! by default), so several relay instances on one host can share a file and
//! operators can follow it with `tail -f relay.jsonl | jq`.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "outbox-relay".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! })?;
//! tracing::info!(batch_size = 100, "dispatcher started");
//! ```

mod json_layer;
mod writer;

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use json_layer::{JsonLayer, LogEntry};
pub use writer::{LogFileWriter, WriterFactory};

/// Errors raised while installing the subscriber.
#[derive(Error, Debug)]
pub enum InitError {
    /// The log file (or its directory) could not be opened.
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No log path was given and the home directory is unknown.
    #[error("could not determine home directory for the default log path")]
    NoHomeDir,

    /// A global subscriber was already installed.
    #[error("subscriber already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every log line.
    pub service_name: String,

    /// Default filter for the file layer (e.g. "debug", "info,relay_outbox=trace").
    /// Overridden by `RUST_LOG` when set.
    pub default_level: String,

    /// Log file path. Defaults to `~/.outbox-relay/logs/relay.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Also emit compact human-readable logs to stderr.
    pub also_stderr: bool,

    /// Filter for the stderr layer when `RUST_LOG` is unset.
    pub stderr_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
            stderr_level: "info".into(),
        }
    }
}

/// Default central log file location.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".outbox-relay").join("logs").join("relay.jsonl"))
}

/// Initialize logging with default settings for `service_name`.
pub fn init(service_name: &str) -> Result<PathBuf, InitError> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Install the global subscriber: JSONL file layer plus optional stderr layer.
///
/// Returns the path of the log file in use.
pub fn init_with_config(config: LogConfig) -> Result<PathBuf, InitError> {
    let log_path = match config.log_path.clone() {
        Some(path) => path,
        None => default_log_path().ok_or(InitError::NoHomeDir)?,
    };

    let writer = LogFileWriter::new(&log_path).map_err(|source| InitError::LogFile {
        path: log_path.clone(),
        source,
    })?;

    let json_layer = JsonLayer::new(config.service_name.clone(), WriterFactory::new(writer));

    let stderr_layer = if config.also_stderr {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_filter(env_filter_or(&config.stderr_level)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(json_layer.with_filter(env_filter_or(&config.default_level)))
        .with(stderr_layer)
        .try_init()
        .map_err(|e| InitError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        log_path = %log_path.display(),
        "observability initialized"
    );

    Ok(log_path)
}

fn env_filter_or(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "unknown");
        assert_eq!(config.default_level, "info");
        assert!(config.log_path.is_none());
        assert!(!config.also_stderr);
        assert_eq!(config.stderr_level, "info");
    }

    #[test]
    fn test_default_log_path_under_relay_dir() {
        if let Some(path) = default_log_path() {
            assert!(path.ends_with(".outbox-relay/logs/relay.jsonl"));
        }
    }

    #[test]
    fn test_init_error_display() {
        let err = InitError::LogFile {
            path: PathBuf::from("/nope/relay.jsonl"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(
            err.to_string(),
            "failed to open log file /nope/relay.jsonl: denied"
        );
    }
}
