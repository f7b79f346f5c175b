//! Search index access for the outbox relay.
//!
//! Every write is conditional on the document's version: a write carrying
//! version `N` lands only if the stored version is lower than `N`. Deletes
//! leave a tombstone at their version so that an upsert delivered late
//! cannot resurrect the document.
//!
//! - [`SearchIndex`]: the conditional write interface the sync worker uses.
//! - [`ElasticsearchIndex`]: external versioning over the REST API.
//! - [`InMemorySearchIndex`]: process-local index for tests and dry runs.

mod document;
mod elasticsearch;
mod error;
mod memory;

pub use document::{IndexDocument, StoredDocument, WriteOutcome};
pub use elasticsearch::{ElasticsearchConfig, ElasticsearchIndex};
pub use error::{IndexError, IndexResult};
pub use memory::{InMemorySearchIndex, WriteRecord};

use async_trait::async_trait;

/// Conditional writes against a versioned document store.
///
/// `index` is the logical index (the aggregate type); implementations map it
/// to their physical naming.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Fetch a document, tombstones included.
    async fn get(&self, index: &str, id: &str) -> IndexResult<Option<StoredDocument>>;

    /// Write `document` if its version is newer than the stored one.
    async fn put_if_newer(&self, document: IndexDocument) -> IndexResult<WriteOutcome>;

    /// Replace the document with a tombstone at `version` if newer.
    async fn tombstone_if_newer(
        &self,
        index: &str,
        id: &str,
        version: i64,
    ) -> IndexResult<WriteOutcome>;
}
