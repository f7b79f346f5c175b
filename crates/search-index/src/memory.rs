//! Process-local search index.
//!
//! Applies the same version guard as the Elasticsearch backend and keeps a
//! log of every write that landed, so tests can assert on the order effects
//! reached the index and not only on the final state.

use crate::{IndexDocument, IndexResult, SearchIndex, StoredDocument, WriteOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One write that passed the version guard.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub index: String,
    pub id: String,
    pub version: i64,
    pub deleted: bool,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<(String, String), StoredDocument>,
    writes: Vec<WriteRecord>,
}

/// In-memory [`SearchIndex`]. Clones share state.
#[derive(Clone, Default)]
pub struct InMemorySearchIndex {
    inner: Arc<Mutex<Inner>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored document, tombstones included.
    pub fn document(&self, index: &str, id: &str) -> Option<StoredDocument> {
        self.inner
            .lock()
            .documents
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    /// Source of a live document; `None` when missing or tombstoned.
    pub fn live_source(&self, index: &str, id: &str) -> Option<Value> {
        self.document(index, id)
            .and_then(|doc| doc.live_source().cloned())
    }

    /// Writes that landed, in the order they landed.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().writes.clone()
    }

    /// Number of live (non-tombstoned) documents.
    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .documents
            .values()
            .filter(|doc| !doc.deleted)
            .count()
    }

    fn write_if_newer(
        &self,
        index: &str,
        id: &str,
        version: i64,
        deleted: bool,
        source: Value,
    ) -> WriteOutcome {
        let mut inner = self.inner.lock();
        let key = (index.to_string(), id.to_string());

        if let Some(current) = inner.documents.get(&key) {
            if current.version >= version {
                return WriteOutcome::Stale {
                    current_version: current.version,
                };
            }
        }

        inner.documents.insert(
            key,
            StoredDocument {
                version,
                deleted,
                source,
            },
        );
        inner.writes.push(WriteRecord {
            index: index.to_string(),
            id: id.to_string(),
            version,
            deleted,
        });
        WriteOutcome::Applied
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn get(&self, index: &str, id: &str) -> IndexResult<Option<StoredDocument>> {
        Ok(self.document(index, id))
    }

    async fn put_if_newer(&self, document: IndexDocument) -> IndexResult<WriteOutcome> {
        Ok(self.write_if_newer(
            &document.index,
            &document.id,
            document.version,
            false,
            document.source,
        ))
    }

    async fn tombstone_if_newer(
        &self,
        index: &str,
        id: &str,
        version: i64,
    ) -> IndexResult<WriteOutcome> {
        Ok(self.write_if_newer(index, id, version, true, Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(version: i64, price: i64) -> IndexDocument {
        IndexDocument {
            index: "order".to_string(),
            id: "42".to_string(),
            version,
            source: json!({ "price": price }),
        }
    }

    #[tokio::test]
    async fn test_newer_version_replaces_document() {
        let index = InMemorySearchIndex::new();
        assert_eq!(index.put_if_newer(doc(1, 10)).await.unwrap(), WriteOutcome::Applied);
        assert_eq!(index.put_if_newer(doc(2, 12)).await.unwrap(), WriteOutcome::Applied);

        let stored = index.get("order", "42").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.source, json!({ "price": 12 }));
        assert_eq!(index.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_equal_or_older_version_is_stale() {
        let index = InMemorySearchIndex::new();
        index.put_if_newer(doc(2, 12)).await.unwrap();

        assert_eq!(
            index.put_if_newer(doc(2, 99)).await.unwrap(),
            WriteOutcome::Stale { current_version: 2 }
        );
        assert_eq!(
            index.put_if_newer(doc(1, 10)).await.unwrap(),
            WriteOutcome::Stale { current_version: 2 }
        );
        assert_eq!(index.live_source("order", "42"), Some(json!({ "price": 12 })));
        assert_eq!(index.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_blocks_late_upsert() {
        let index = InMemorySearchIndex::new();
        index.put_if_newer(doc(1, 10)).await.unwrap();
        assert_eq!(
            index.tombstone_if_newer("order", "42", 3).await.unwrap(),
            WriteOutcome::Applied
        );

        assert_eq!(
            index.put_if_newer(doc(2, 12)).await.unwrap(),
            WriteOutcome::Stale { current_version: 3 }
        );
        assert_eq!(index.live_source("order", "42"), None);
        assert!(index.document("order", "42").unwrap().deleted);
        assert_eq!(index.live_count(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let index = InMemorySearchIndex::new();
        let other = index.clone();
        other.put_if_newer(doc(1, 10)).await.unwrap();
        assert_eq!(index.live_count(), 1);
    }
}
