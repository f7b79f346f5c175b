//! Version-guarded application of outbox events.

use crate::{DocumentMapper, IndexMutation, JsonSnapshotMapper, MappingError, SyncError};
use relay_outbox::{FailureKind, OutboxEvent};
use search_index::{IndexDocument, SearchIndex, WriteOutcome};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The index write landed.
    Success,
    /// The index already holds this version or a later one.
    StaleSkip { current_version: i64 },
    /// Worth retrying after backoff.
    TransientFailure(String),
    /// Retrying cannot help.
    PermanentFailure(String),
}

impl SyncOutcome {
    pub fn failure(&self) -> Option<(FailureKind, &str)> {
        match self {
            Self::TransientFailure(message) => Some((FailureKind::Transient, message.as_str())),
            Self::PermanentFailure(message) => Some((FailureKind::Permanent, message.as_str())),
            Self::Success | Self::StaleSkip { .. } => None,
        }
    }
}

impl From<Result<WriteOutcome, SyncError>> for SyncOutcome {
    fn from(result: Result<WriteOutcome, SyncError>) -> Self {
        match result {
            Ok(WriteOutcome::Applied) => Self::Success,
            Ok(WriteOutcome::Stale { current_version }) => Self::StaleSkip { current_version },
            Err(e) if e.is_transient() => Self::TransientFailure(e.to_string()),
            Err(e) => Self::PermanentFailure(e.to_string()),
        }
    }
}

/// Applies events to a [`SearchIndex`]. Cheap to clone.
#[derive(Clone)]
pub struct SyncWorker {
    index: Arc<dyn SearchIndex>,
    mapper: Arc<dyn DocumentMapper>,
}

impl SyncWorker {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self::with_mapper(index, Arc::new(JsonSnapshotMapper))
    }

    pub fn with_mapper(index: Arc<dyn SearchIndex>, mapper: Arc<dyn DocumentMapper>) -> Self {
        Self { index, mapper }
    }

    /// Apply `event` if its sequence number is newer than the document's
    /// version.
    pub async fn apply(&self, event: &OutboxEvent) -> SyncOutcome {
        let outcome = SyncOutcome::from(self.try_apply(event).await);

        match &outcome {
            SyncOutcome::Success => debug!(
                event_id = %event.event_id,
                aggregate = %event.key(),
                sequence = event.sequence_number,
                event_type = %event.event_type,
                "Event applied to index"
            ),
            SyncOutcome::StaleSkip { current_version } => debug!(
                event_id = %event.event_id,
                aggregate = %event.key(),
                sequence = event.sequence_number,
                current_version,
                "Index already at or past event, skipping"
            ),
            _ => {}
        }

        outcome
    }

    async fn try_apply(&self, event: &OutboxEvent) -> Result<WriteOutcome, SyncError> {
        let version = event.sequence_number;

        match self.mapper.map(event)? {
            IndexMutation::Upsert { source } => Ok(self
                .index
                .put_if_newer(IndexDocument {
                    index: event.aggregate_type.clone(),
                    id: event.aggregate_id.clone(),
                    version,
                    source,
                })
                .await?),
            IndexMutation::Delete => Ok(self
                .index
                .tombstone_if_newer(&event.aggregate_type, &event.aggregate_id, version)
                .await?),
            IndexMutation::Merge { fields } => self.merge(event, fields).await,
        }
    }

    async fn merge(
        &self,
        event: &OutboxEvent,
        fields: Map<String, Value>,
    ) -> Result<WriteOutcome, SyncError> {
        let version = event.sequence_number;
        let current = self
            .index
            .get(&event.aggregate_type, &event.aggregate_id)
            .await?;

        let mut source = match current {
            Some(doc) if doc.version >= version => {
                return Ok(WriteOutcome::Stale {
                    current_version: doc.version,
                })
            }
            Some(doc) if !doc.deleted => match doc.source {
                Value::Object(existing) => existing,
                _ => Map::new(),
            },
            _ => return Err(MappingError::MissingDocument(event.key().to_string()).into()),
        };

        source.extend(fields);
        Ok(self
            .index
            .put_if_newer(IndexDocument {
                index: event.aggregate_type.clone(),
                id: event.aggregate_id.clone(),
                version,
                source: Value::Object(source),
            })
            .await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use relay_outbox::{EventType, OutboxStatus};
    use search_index::{InMemorySearchIndex, IndexError, IndexResult, StoredDocument};
    use serde_json::json;

    pub(crate) fn event(sequence: i64, event_type: EventType, payload: &str) -> OutboxEvent {
        let now = Utc::now();
        OutboxEvent {
            position: sequence,
            event_id: format!("evt-{sequence}"),
            aggregate_type: "order".to_string(),
            aggregate_id: "order-42".to_string(),
            sequence_number: sequence,
            event_type,
            payload: payload.to_string(),
            status: OutboxStatus::Claimed,
            retry_count: 0,
            next_attempt_at: now,
            last_error: None,
            claim_token: Some("token".to_string()),
            claimed_by: Some("test".to_string()),
            claimed_at: Some(now),
            created_at: now,
            dispatched_at: None,
        }
    }

    /// Index that answers every write with a fixed HTTP status.
    struct FailingIndex(u16);

    #[async_trait]
    impl SearchIndex for FailingIndex {
        async fn get(&self, _index: &str, _id: &str) -> IndexResult<Option<StoredDocument>> {
            Err(IndexError::from_status(self.0, "failing"))
        }

        async fn put_if_newer(&self, _document: IndexDocument) -> IndexResult<WriteOutcome> {
            Err(IndexError::from_status(self.0, "failing"))
        }

        async fn tombstone_if_newer(
            &self,
            _index: &str,
            _id: &str,
            _version: i64,
        ) -> IndexResult<WriteOutcome> {
            Err(IndexError::from_status(self.0, "failing"))
        }
    }

    fn worker() -> (InMemorySearchIndex, SyncWorker) {
        let index = InMemorySearchIndex::new();
        (index.clone(), SyncWorker::new(Arc::new(index)))
    }

    #[tokio::test]
    async fn test_order_lifecycle_ends_deleted() {
        let (index, worker) = worker();
        let created = event(1, EventType::Created, r#"{"price":10}"#);
        let updated = event(2, EventType::Updated, r#"{"price":12}"#);
        let deleted = event(3, EventType::Deleted, "{}");

        assert_eq!(worker.apply(&created).await, SyncOutcome::Success);
        assert_eq!(worker.apply(&updated).await, SyncOutcome::Success);
        assert_eq!(
            index.live_source("order", "order-42"),
            Some(json!({ "price": 12 }))
        );
        assert_eq!(worker.apply(&deleted).await, SyncOutcome::Success);
        assert_eq!(index.live_source("order", "order-42"), None);

        // Replaying the update after the delete is a no-op.
        assert_eq!(
            worker.apply(&updated).await,
            SyncOutcome::StaleSkip { current_version: 3 }
        );
        assert_eq!(index.live_source("order", "order-42"), None);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_stale_skip() {
        let (index, worker) = worker();
        let created = event(1, EventType::Created, r#"{"price":10}"#);

        assert_eq!(worker.apply(&created).await, SyncOutcome::Success);
        let after_first = index.document("order", "order-42");
        assert_eq!(
            worker.apply(&created).await,
            SyncOutcome::StaleSkip { current_version: 1 }
        );
        assert_eq!(index.document("order", "order-42"), after_first);
        assert_eq!(index.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_popularity_update_merges_fields() {
        let (index, worker) = worker();
        worker
            .apply(&event(1, EventType::Created, r#"{"title":"Rust engineer","views":1}"#))
            .await;

        let outcome = worker
            .apply(&event(2, EventType::PopularityOnly, r#"{"views":7}"#))
            .await;
        assert_eq!(outcome, SyncOutcome::Success);
        assert_eq!(
            index.live_source("order", "order-42"),
            Some(json!({ "title": "Rust engineer", "views": 7 }))
        );
        assert_eq!(index.document("order", "order-42").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_stale_popularity_update_is_skipped() {
        let (_, worker) = worker();
        worker
            .apply(&event(3, EventType::Updated, r#"{"views":1}"#))
            .await;
        assert_eq!(
            worker
                .apply(&event(2, EventType::PopularityOnly, r#"{"views":7}"#))
                .await,
            SyncOutcome::StaleSkip { current_version: 3 }
        );
    }

    #[tokio::test]
    async fn test_merge_without_document_is_permanent() {
        let (_, worker) = worker();
        let outcome = worker
            .apply(&event(1, EventType::PopularityOnly, r#"{"views":7}"#))
            .await;
        assert!(matches!(outcome, SyncOutcome::PermanentFailure(msg) if msg.contains("order/order-42")));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_permanent() {
        let (index, worker) = worker();
        let outcome = worker.apply(&event(1, EventType::Created, "{oops")).await;
        assert_eq!(
            outcome.failure().map(|(kind, _)| kind),
            Some(FailureKind::Permanent)
        );
        assert!(index.writes().is_empty());
    }

    #[tokio::test]
    async fn test_index_errors_are_classified() {
        let unavailable = SyncWorker::new(Arc::new(FailingIndex(503)));
        let outcome = unavailable
            .apply(&event(1, EventType::Created, r#"{"price":10}"#))
            .await;
        assert!(matches!(outcome, SyncOutcome::TransientFailure(_)));
        assert!(outcome.failure().is_some());

        let rejecting = SyncWorker::new(Arc::new(FailingIndex(400)));
        let outcome = rejecting
            .apply(&event(1, EventType::Deleted, "{}"))
            .await;
        assert!(matches!(outcome, SyncOutcome::PermanentFailure(_)));
    }
}
