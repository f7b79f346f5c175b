//! Failure routing and dead-letter operations.
//!
//! Failed attempts are turned into a persisted outcome here: another attempt
//! after backoff, or quarantine in `dead`. A dead event keeps holding the
//! later events of its own aggregate (the claim query enforces that) until an
//! operator requeues or discards it. Other aggregates are unaffected.

use crate::{OutboxError, OutboxResult, OutboxStore, FailureDecision, FailureKind, RetryPolicy};
use chrono::{DateTime, Utc};
use relay_database::{queries, DatabaseError, FailureUpdate, OutboxEvent, OutboxStatus};
use tracing::{error, info, warn};

/// What happened to a failed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Scheduled for another attempt.
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Moved to `dead`.
    DeadLettered { retry_count: u32 },
    /// The claim expired and was swept before the outcome could be written;
    /// the event is someone else's now.
    ClaimLost,
}

/// Applies the retry policy and serves operator dead-letter actions.
#[derive(Clone)]
pub struct DeadLetterManager {
    store: OutboxStore,
    policy: RetryPolicy,
}

impl DeadLetterManager {
    pub fn new(store: OutboxStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt on a claimed event.
    pub async fn handle_failure(
        &self,
        event: &OutboxEvent,
        claim_token: &str,
        kind: FailureKind,
        error_message: &str,
    ) -> OutboxResult<FailureDisposition> {
        let now = Utc::now();
        let decision = self.policy.decide(event.retry_count, kind, now);

        let (update, disposition) = match decision {
            FailureDecision::Retry {
                retry_count,
                next_attempt_at,
                ..
            } => (
                FailureUpdate {
                    status: OutboxStatus::Failed,
                    retry_count,
                    next_attempt_at,
                    last_error: error_message.to_string(),
                },
                FailureDisposition::Retrying {
                    retry_count,
                    next_attempt_at,
                },
            ),
            FailureDecision::Dead { retry_count } => (
                FailureUpdate {
                    status: OutboxStatus::Dead,
                    retry_count,
                    next_attempt_at: now,
                    last_error: error_message.to_string(),
                },
                FailureDisposition::DeadLettered { retry_count },
            ),
        };

        if !self
            .store
            .mark_failed(&event.event_id, claim_token, update)
            .await?
        {
            warn!(
                event_id = %event.event_id,
                aggregate = %event.key(),
                "Claim lost before failure could be recorded"
            );
            return Ok(FailureDisposition::ClaimLost);
        }

        match &disposition {
            FailureDisposition::Retrying {
                retry_count,
                next_attempt_at,
            } => warn!(
                event_id = %event.event_id,
                aggregate = %event.key(),
                sequence = event.sequence_number,
                retry_count,
                next_attempt_at = %next_attempt_at,
                error = error_message,
                "Sync attempt failed, will retry"
            ),
            FailureDisposition::DeadLettered { retry_count } => error!(
                event_id = %event.event_id,
                aggregate = %event.key(),
                sequence = event.sequence_number,
                retry_count,
                permanent = kind == FailureKind::Permanent,
                error = error_message,
                "Event dead-lettered; later events of this aggregate are held"
            ),
            FailureDisposition::ClaimLost => {}
        }

        Ok(disposition)
    }

    /// Dead events, oldest first.
    pub async fn list(&self, limit: usize) -> OutboxResult<Vec<OutboxEvent>> {
        self.store.list(OutboxStatus::Dead, limit).await
    }

    /// Return a dead event to `pending` with a fresh retry budget.
    ///
    /// Checkpoints above the event's position are lowered in the same
    /// transaction so the next scan sees it.
    pub async fn requeue(&self, event_id: &str) -> OutboxResult<()> {
        let id = event_id.to_string();
        let position = self
            .store
            .database()
            .transaction(move |tx| {
                let now = Utc::now();
                let position = queries::requeue_dead_event(tx, &id, now)?;
                if let Some(position) = position {
                    queries::lower_checkpoints(tx, position, now)?;
                }
                Ok::<_, DatabaseError>(position)
            })
            .await?;

        match position {
            Some(position) => {
                info!(event_id, position, "Dead event requeued");
                Ok(())
            }
            None => Err(self.missing_dead_event(event_id).await?),
        }
    }

    /// Permanently drop a dead event. Later events of the same aggregate
    /// become deliverable.
    pub async fn discard(&self, event_id: &str) -> OutboxResult<()> {
        let id = event_id.to_string();
        let deleted = self
            .store
            .database()
            .call(move |conn| queries::delete_dead_event(conn, &id))
            .await?;

        if deleted {
            info!(event_id, "Dead event discarded");
            Ok(())
        } else {
            Err(self.missing_dead_event(event_id).await?)
        }
    }

    async fn missing_dead_event(&self, event_id: &str) -> OutboxResult<OutboxError> {
        Ok(match self.store.get(event_id).await? {
            Some(event) => OutboxError::InvalidState(format!(
                "event {event_id} is {}, not dead",
                event.status
            )),
            None => OutboxError::NotFound(format!("event {event_id}")),
        })
    }
}
