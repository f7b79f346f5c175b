//! Outbox error types.

use relay_database::DatabaseError;
use thiserror::Error;

/// Errors from outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation not valid for the event's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Event not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for OutboxError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}

/// Result type for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;
