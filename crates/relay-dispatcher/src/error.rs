//! Dispatcher error types.

use relay_outbox::OutboxError;
use thiserror::Error;

/// Errors that abort a whole dispatch cycle. Per-event failures never
/// surface here; they become event status changes.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Outbox store unreachable or failing
    #[error("Outbox store error: {0}")]
    Store(#[from] OutboxError),

    /// Another cycle of this dispatcher is still running
    #[error("Dispatch cycle already in progress")]
    CycleInProgress,

    /// Shutdown was signalled before the cycle could claim anything
    #[error("Dispatcher is shutting down")]
    Shutdown,
}

impl DispatchError {
    /// Whether the error means the outbox store could not be reached.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
