//! Per-partition recovery checkpoint.
//!
//! The checkpoint records the lowest outbox position that may still need
//! delivery for a partition (an aggregate type, or every type). Dispatchers
//! start their claim scan there instead of at the beginning of the table. It
//! is only a scan bound: event status and the index version guard decide
//! correctness, so a lost or stale checkpoint costs a longer scan and nothing
//! else.

use crate::OutboxResult;
use chrono::Utc;
use relay_database::{queries, AsyncDatabase, DatabaseError, SyncCheckpoint};
use tracing::debug;

/// Partition key used when a dispatcher covers every aggregate type.
pub const ALL_PARTITIONS: &str = "*";

/// Reads and advances the checkpoint of one partition.
#[derive(Clone)]
pub struct CheckpointTracker {
    db: AsyncDatabase,
    aggregate_type: Option<String>,
    partition_key: String,
}

impl CheckpointTracker {
    pub fn new(db: AsyncDatabase, aggregate_type: Option<String>) -> Self {
        let partition_key = aggregate_type
            .clone()
            .unwrap_or_else(|| ALL_PARTITIONS.to_string());
        Self {
            db,
            aggregate_type,
            partition_key,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub async fn load(&self) -> OutboxResult<Option<SyncCheckpoint>> {
        let key = self.partition_key.clone();
        let checkpoint = self
            .db
            .call(move |conn| queries::get_checkpoint(conn, &key))
            .await?;
        Ok(checkpoint)
    }

    /// Position the next claim scan may start from (0 without a checkpoint).
    pub async fn scan_floor(&self) -> OutboxResult<i64> {
        Ok(self
            .load()
            .await?
            .map(|checkpoint| checkpoint.low_water_position)
            .unwrap_or(0))
    }

    /// Recompute the low-water mark from event status and persist it.
    pub async fn advance(&self) -> OutboxResult<SyncCheckpoint> {
        let key = self.partition_key.clone();
        let aggregate_type = self.aggregate_type.clone();

        let checkpoint = self
            .db
            .transaction(move |tx| {
                let now = Utc::now();
                let (low_water, last_dispatched) =
                    queries::compute_checkpoint_positions(tx, aggregate_type.as_deref())?;
                queries::upsert_checkpoint(tx, &key, low_water, last_dispatched, now)?;
                queries::get_checkpoint(tx, &key)?
                    .ok_or_else(|| DatabaseError::NotFound(format!("checkpoint {key}")))
            })
            .await?;

        debug!(
            partition = %checkpoint.partition,
            low_water = checkpoint.low_water_position,
            last_dispatched = checkpoint.last_dispatched_position,
            "Checkpoint advanced"
        );
        Ok(checkpoint)
    }
}
