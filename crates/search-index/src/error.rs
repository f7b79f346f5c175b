//! Error types for search index operations.

use thiserror::Error;

/// Errors returned by [`SearchIndex`](crate::SearchIndex) implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Network or transport-level HTTP error from reqwest.
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The index answered but cannot serve the request right now
    /// (5xx, 429, authentication).
    #[error("Index unavailable: {status} - {message}")]
    Unavailable { status: u16, message: String },

    /// The request did not complete within the configured timeout.
    #[error("Index request timed out: {0}")]
    Timeout(String),

    /// A concurrent write won and its version could not be read back.
    #[error("Version conflict on {index}/{id}")]
    VersionConflict { index: String, id: String },

    /// The index refused the document (mapping or schema violation).
    #[error("Index rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// The response body did not have the expected shape.
    #[error("Malformed index response: {0}")]
    MalformedResponse(String),

    /// Invalid URL, credentials, or client setup.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IndexError {
    /// Whether retrying the same write later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::Unavailable { .. }
            | Self::Timeout(_)
            | Self::VersionConflict { .. } => true,
            Self::Rejected { .. } | Self::MalformedResponse(_) | Self::Config(_) => false,
        }
    }

    /// Build the error for a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 | 408 | 429 | 500..=599 => Self::Unavailable { status, message },
            _ => Self::Rejected { status, message },
        }
    }

    pub(crate) fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Transport(e)
        }
    }
}

/// Result type for search index operations.
pub type IndexResult<T> = Result<T, IndexError>;
