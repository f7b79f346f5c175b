use search_index::IndexError;
use thiserror::Error;

/// The event cannot be turned into an index mutation.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),

    /// A partial update arrived for a document that does not exist.
    #[error("no live document to merge into: {0}")]
    MissingDocument(String),
}

/// Failure while applying an event.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("mapping failed: {0}")]
    Mapping(#[from] MappingError),

    #[error("index write failed: {0}")]
    Index(#[from] IndexError),
}

impl SyncError {
    /// Mapping errors never heal on retry; index errors defer to
    /// [`IndexError::is_transient`].
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Mapping(_) => false,
            Self::Index(e) => e.is_transient(),
        }
    }
}
