//! Database model types.

use crate::{DatabaseError, DatabaseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outbox event status.
///
/// `pending -> claimed -> dispatched` on success, `claimed -> failed -> claimed`
/// on retry, and `failed`/`claimed -> dead` once the event cannot be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Claimed,
    Failed,
    Dispatched,
    Dead,
}

impl Default for OutboxStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        Self::Pending,
        Self::Claimed,
        Self::Failed,
        Self::Dispatched,
        Self::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Failed => "failed",
            Self::Dispatched => "dispatched",
            Self::Dead => "dead",
        }
    }

    /// Dispatched and dead events are never claimed again without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Dead)
    }
}

impl FromStr for OutboxStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "failed" => Ok(Self::Failed),
            "dispatched" => Ok(Self::Dispatched),
            "dead" => Ok(Self::Dead),
            other => Err(DatabaseError::InvalidData(format!(
                "unknown outbox status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of change an event records.
///
/// Unknown tags are preserved as `Other` so domain-specific event types
/// survive a round trip through the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Created,
    Updated,
    /// Partial update touching only popularity counters.
    PopularityOnly,
    Deleted,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::PopularityOnly => "popularity_only",
            Self::Deleted => "deleted",
            Self::Other(tag) => tag,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "popularity_only" => Self::PopularityOnly,
            "deleted" => Self::Deleted,
            _ => Self::Other(s.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a business entity; the unit of ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub aggregate_type: String,
    pub aggregate_id: String,
}

impl AggregateKey {
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.aggregate_id)
    }
}

/// Event to append, as supplied by the business-write path.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: EventType,
    /// Serialized JSON; opaque to the relay.
    pub payload: String,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: EventType,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type,
            payload: payload.into(),
        }
    }

    /// Build an event whose payload is `snapshot` serialized as JSON.
    pub fn with_json<T: Serialize>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: EventType,
        snapshot: &T,
    ) -> DatabaseResult<Self> {
        Ok(Self::new(
            aggregate_type,
            aggregate_id,
            event_type,
            serde_json::to_string(snapshot)?,
        ))
    }
}

/// Identifiers assigned when an event is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendedEvent {
    pub event_id: String,
    pub sequence_number: i64,
    pub position: i64,
}

/// A row of the outbox log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub position: i64,
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub sequence_number: i64,
    pub event_type: EventType,
    pub payload: String,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claim_token: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn key(&self) -> AggregateKey {
        AggregateKey::new(self.aggregate_type.clone(), self.aggregate_id.clone())
    }

    pub fn payload_json(&self) -> DatabaseResult<serde_json::Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Parameters of one atomic claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub limit: usize,
    /// Restrict the claim to one aggregate type.
    pub partition: Option<String>,
    /// Skip rows below this position (checkpoint low-water mark).
    pub min_position: i64,
    pub claim_token: String,
    pub claimed_by: String,
    pub now: DateTime<Utc>,
}

/// Outcome persisted for a failed attempt.
#[derive(Debug, Clone)]
pub struct FailureUpdate {
    /// `Failed` (will retry) or `Dead`.
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: String,
}

/// Per-partition recovery checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncCheckpoint {
    pub partition: String,
    /// Lowest position that may still need dispatching.
    pub low_water_position: i64,
    pub last_dispatched_position: i64,
    pub updated_at: DateTime<Utc>,
}

/// Operator health view of the outbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub claimed: u64,
    pub failed: u64,
    pub dispatched: u64,
    pub dead: u64,
    /// Creation time of the oldest event still awaiting dispatch (dead excluded).
    pub oldest_undispatched_at: Option<DateTime<Utc>>,
    /// Age of that event in seconds.
    pub staleness_secs: Option<i64>,
}

impl OutboxStats {
    pub fn count(&self, status: OutboxStatus) -> u64 {
        match status {
            OutboxStatus::Pending => self.pending,
            OutboxStatus::Claimed => self.claimed,
            OutboxStatus::Failed => self.failed,
            OutboxStatus::Dispatched => self.dispatched,
            OutboxStatus::Dead => self.dead,
        }
    }

    pub(crate) fn set_count(&mut self, status: OutboxStatus, count: u64) {
        match status {
            OutboxStatus::Pending => self.pending = count,
            OutboxStatus::Claimed => self.claimed = count,
            OutboxStatus::Failed => self.failed = count,
            OutboxStatus::Dispatched => self.dispatched = count,
            OutboxStatus::Dead => self.dead = count,
        }
    }

    /// Events not yet applied and still eligible for delivery.
    pub fn in_flight(&self) -> u64 {
        self.pending + self.claimed + self.failed
    }
}

impl fmt::Display for OutboxStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending={} claimed={} failed={} dispatched={} dead={}",
            self.pending, self.claimed, self.failed, self.dispatched, self.dead
        )?;
        if let Some(secs) = self.staleness_secs {
            write!(f, " staleness={secs}s")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        for status in OutboxStatus::ALL {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!(matches!(
            "sent".parse::<OutboxStatus>(),
            Err(DatabaseError::InvalidData(_))
        ));
        assert!(OutboxStatus::Dead.is_terminal());
        assert!(!OutboxStatus::Failed.is_terminal());
    }

    #[test]
    fn test_event_type_tags() {
        assert_eq!(EventType::from("CREATED"), EventType::Created);
        assert_eq!(EventType::from("popularity_only"), EventType::PopularityOnly);
        assert_eq!(
            EventType::from("archived"),
            EventType::Other("archived".to_string())
        );
        assert_eq!(EventType::Other("archived".into()).as_str(), "archived");
        assert!(EventType::Deleted.is_delete());

        let json = serde_json::to_string(&EventType::PopularityOnly).unwrap();
        assert_eq!(json, "\"popularity_only\"");
    }

    #[test]
    fn test_aggregate_key_ordering() {
        let mut keys = vec![
            AggregateKey::new("order", "9"),
            AggregateKey::new("job", "2"),
            AggregateKey::new("job", "10"),
        ];
        keys.sort();
        assert_eq!(keys[0].to_string(), "job/10");
        assert_eq!(keys[2].to_string(), "order/9");
    }

    #[test]
    fn test_new_event_with_json() {
        let event = NewOutboxEvent::with_json(
            "order",
            "order-42",
            EventType::Updated,
            &serde_json::json!({"price": 12}),
        )
        .unwrap();
        assert_eq!(event.payload, r#"{"price":12}"#);
    }

    #[test]
    fn test_stats_display() {
        let mut stats = OutboxStats::default();
        stats.set_count(OutboxStatus::Pending, 3);
        stats.set_count(OutboxStatus::Dead, 1);
        stats.staleness_secs = Some(12);
        assert_eq!(stats.in_flight(), 3);
        assert_eq!(
            stats.to_string(),
            "pending=3 claimed=0 failed=0 dispatched=0 dead=1 staleness=12s"
        );
    }
}
