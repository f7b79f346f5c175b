//! Outbox store: append, claim, and outcome tracking over SQLite.

use crate::{OutboxError, OutboxResult, OutboxTransaction};
use chrono::Utc;
use relay_database::{
    queries, AppendedEvent, AsyncDatabase, ClaimRequest, FailureUpdate, NewOutboxEvent,
    OutboxEvent, OutboxStats, OutboxStatus,
};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Events claimed together under one token.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub claim_token: String,
    /// Ordered by aggregate type, aggregate id, then sequence number.
    pub events: Vec<OutboxEvent>,
}

impl ClaimedBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Handle to the outbox tables. Cheap to clone.
#[derive(Clone)]
pub struct OutboxStore {
    db: AsyncDatabase,
}

impl OutboxStore {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &AsyncDatabase {
        &self.db
    }

    /// Run a business write and its outbox appends in one transaction.
    ///
    /// ```ignore
    /// store.write(|otx| {
    ///     otx.connection().execute("UPDATE orders SET price = 12 WHERE id = ?1", ["order-42"])?;
    ///     otx.append(&NewOutboxEvent::with_json("order", "order-42", EventType::Updated, &order)?)?;
    ///     Ok::<_, OutboxError>(())
    /// }).await?;
    /// ```
    pub async fn write<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&mut OutboxTransaction<'a>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<relay_database::DatabaseError> + Send + 'static,
    {
        self.db
            .transaction(move |tx| {
                let mut scope = OutboxTransaction::new(tx, Utc::now());
                f(&mut scope)
            })
            .await
    }

    /// Append a single event in its own transaction.
    pub async fn append(&self, event: NewOutboxEvent) -> OutboxResult<AppendedEvent> {
        self.write(move |otx| otx.append(&event)).await
    }

    /// Atomically claim up to `limit` deliverable events.
    ///
    /// `partition` restricts the claim to one aggregate type and
    /// `min_position` skips rows below the checkpoint low-water mark.
    pub async fn claim_batch(
        &self,
        limit: usize,
        partition: Option<&str>,
        min_position: i64,
        claimed_by: &str,
    ) -> OutboxResult<ClaimedBatch> {
        let request = ClaimRequest {
            limit,
            partition: partition.map(str::to_string),
            min_position,
            claim_token: Uuid::new_v4().to_string(),
            claimed_by: claimed_by.to_string(),
            now: Utc::now(),
        };
        let claim_token = request.claim_token.clone();

        let events = self
            .db
            .transaction(move |tx| queries::claim_outbox_batch(tx, &request))
            .await?;

        if !events.is_empty() {
            debug!(
                claim_token = %claim_token,
                claimed_by,
                count = events.len(),
                "Claimed outbox batch"
            );
        }

        Ok(ClaimedBatch {
            claim_token,
            events,
        })
    }

    /// Mark events dispatched under `claim_token`. Returns how many rows
    /// were still held by that claim.
    pub async fn mark_dispatched(&self, event_ids: Vec<String>, claim_token: &str) -> OutboxResult<usize> {
        let token = claim_token.to_string();
        let count = self
            .db
            .call(move |conn| queries::mark_dispatched(conn, &event_ids, &token, Utc::now()))
            .await?;
        Ok(count)
    }

    /// Renew the claim on events still held under `claim_token`. Returns how
    /// many were renewed.
    pub async fn renew_claims(&self, event_ids: Vec<String>, claim_token: &str) -> OutboxResult<usize> {
        let token = claim_token.to_string();
        let count = self
            .db
            .call(move |conn| queries::touch_claims(conn, &event_ids, &token, Utc::now()))
            .await?;
        Ok(count)
    }

    /// Persist a failed attempt. Returns false if the claim was lost.
    pub async fn mark_failed(
        &self,
        event_id: &str,
        claim_token: &str,
        update: FailureUpdate,
    ) -> OutboxResult<bool> {
        let event_id = event_id.to_string();
        let token = claim_token.to_string();
        let recorded = self
            .db
            .call(move |conn| queries::record_failure(conn, &event_id, &token, &update))
            .await?;
        Ok(recorded)
    }

    /// Return claimed events to `pending` without using retry budget.
    pub async fn release(&self, event_ids: Vec<String>, claim_token: &str) -> OutboxResult<usize> {
        let token = claim_token.to_string();
        let count = self
            .db
            .call(move |conn| queries::release_claims(conn, &event_ids, &token))
            .await?;
        Ok(count)
    }

    /// Requeue claims older than `timeout` (crashed or stalled dispatchers).
    pub async fn sweep_expired_claims(&self, timeout: Duration) -> OutboxResult<usize> {
        let cutoff = Utc::now() - to_chrono(timeout)?;
        let count = self
            .db
            .call(move |conn| queries::requeue_expired_claims(conn, cutoff))
            .await?;
        Ok(count)
    }

    /// Delete dispatched events older than `retention`.
    pub async fn purge_dispatched(&self, retention: Duration) -> OutboxResult<usize> {
        let cutoff = Utc::now() - to_chrono(retention)?;
        let count = self
            .db
            .call(move |conn| queries::purge_dispatched(conn, cutoff))
            .await?;
        if count > 0 {
            info!(count, "Purged dispatched outbox events");
        }
        Ok(count)
    }

    pub async fn stats(&self) -> OutboxResult<OutboxStats> {
        let stats = self
            .db
            .call(|conn| queries::outbox_stats(conn, Utc::now()))
            .await?;
        Ok(stats)
    }

    pub async fn get(&self, event_id: &str) -> OutboxResult<Option<OutboxEvent>> {
        let event_id = event_id.to_string();
        let event = self
            .db
            .call(move |conn| queries::get_outbox_event(conn, &event_id))
            .await?;
        Ok(event)
    }

    pub async fn list(&self, status: OutboxStatus, limit: usize) -> OutboxResult<Vec<OutboxEvent>> {
        let events = self
            .db
            .call(move |conn| queries::list_outbox_events(conn, status, limit))
            .await?;
        Ok(events)
    }

    /// Retained events of one aggregate in sequence order.
    pub async fn aggregate_history(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let aggregate_type = aggregate_type.to_string();
        let aggregate_id = aggregate_id.to_string();
        let events = self
            .db
            .call(move |conn| queries::list_aggregate_events(conn, &aggregate_type, &aggregate_id))
            .await?;
        Ok(events)
    }
}

pub(crate) fn to_chrono(duration: Duration) -> OutboxResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| OutboxError::InvalidState(format!("duration out of range: {e}")))
}
