use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document write at a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Logical index (aggregate type).
    pub index: String,
    /// Document id (aggregate id).
    pub id: String,
    /// Sequence number of the event that produced this state.
    pub version: i64,
    pub source: Value,
}

/// What the index currently holds for a document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub version: i64,
    /// Tombstone left by a versioned delete.
    pub deleted: bool,
    pub source: Value,
}

impl StoredDocument {
    /// The source if the document is live.
    pub fn live_source(&self) -> Option<&Value> {
        if self.deleted {
            None
        } else {
            Some(&self.source)
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The stored version was already at or above the write's version.
    Stale { current_version: i64 },
}
