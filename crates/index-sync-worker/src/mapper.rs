//! Event to index mutation mapping.

use crate::MappingError;
use relay_outbox::{EventType, OutboxEvent};
use serde_json::{Map, Value};

/// Change to make to the aggregate's document.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexMutation {
    /// Replace the whole source.
    Upsert { source: Value },
    /// Overwrite only these top-level fields of the existing source.
    Merge { fields: Map<String, Value> },
    /// Replace the document with a tombstone.
    Delete,
}

/// Builds index mutations from outbox events.
pub trait DocumentMapper: Send + Sync {
    fn map(&self, event: &OutboxEvent) -> Result<IndexMutation, MappingError>;
}

/// Treats the payload as the full document snapshot.
///
/// `created`/`updated` upsert the payload object, `popularity_only` merges
/// it into the stored source and `deleted` tombstones the document. Other
/// event types are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSnapshotMapper;

impl DocumentMapper for JsonSnapshotMapper {
    fn map(&self, event: &OutboxEvent) -> Result<IndexMutation, MappingError> {
        match &event.event_type {
            EventType::Deleted => Ok(IndexMutation::Delete),
            EventType::Created | EventType::Updated => Ok(IndexMutation::Upsert {
                source: Value::Object(payload_object(event)?),
            }),
            EventType::PopularityOnly => Ok(IndexMutation::Merge {
                fields: payload_object(event)?,
            }),
            EventType::Other(tag) => Err(MappingError::UnsupportedEventType(tag.clone())),
        }
    }
}

fn payload_object(event: &OutboxEvent) -> Result<Map<String, Value>, MappingError> {
    let value: Value = serde_json::from_str(&event.payload).map_err(|e| {
        MappingError::InvalidPayload(format!("event {}: {e}", event.event_id))
    })?;

    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(MappingError::InvalidPayload(format!(
            "event {}: expected a JSON object, got {}",
            event.event_id,
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::event;
    use serde_json::json;

    #[test]
    fn test_snapshot_events_upsert() {
        let mapped = JsonSnapshotMapper
            .map(&event(1, EventType::Created, r#"{"title":"Rust engineer"}"#))
            .unwrap();
        assert_eq!(
            mapped,
            IndexMutation::Upsert {
                source: json!({ "title": "Rust engineer" })
            }
        );
    }

    #[test]
    fn test_popularity_only_merges() {
        let mapped = JsonSnapshotMapper
            .map(&event(2, EventType::PopularityOnly, r#"{"views":7}"#))
            .unwrap();
        match mapped {
            IndexMutation::Merge { fields } => assert_eq!(fields.get("views"), Some(&json!(7))),
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_ignores_payload() {
        let mapped = JsonSnapshotMapper
            .map(&event(3, EventType::Deleted, "not json"))
            .unwrap();
        assert_eq!(mapped, IndexMutation::Delete);
    }

    #[test]
    fn test_rejects_bad_payloads_and_unknown_types() {
        assert!(matches!(
            JsonSnapshotMapper.map(&event(1, EventType::Updated, "{broken")),
            Err(MappingError::InvalidPayload(_))
        ));
        assert!(matches!(
            JsonSnapshotMapper.map(&event(1, EventType::Updated, "[1,2]")),
            Err(MappingError::InvalidPayload(msg)) if msg.contains("array")
        ));
        assert!(matches!(
            JsonSnapshotMapper.map(&event(1, EventType::Other("archived".into()), "{}")),
            Err(MappingError::UnsupportedEventType(tag)) if tag == "archived"
        ));
    }
}
