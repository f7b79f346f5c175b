use crate::{DispatchError, DispatchResult, DispatcherConfig};
use index_sync_worker::{SyncOutcome, SyncWorker};
use relay_outbox::{
    AggregateKey, CheckpointTracker, DeadLetterManager, FailureDisposition, OutboxEvent,
    OutboxStore, RetryPolicy,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Counts from one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub dispatched: usize,
    /// Dispatched as a stale skip (index already at or past the event).
    pub stale: usize,
    /// Scheduled for retry.
    pub failed: usize,
    pub dead: usize,
    /// Returned to pending behind a failed event of the same aggregate.
    pub released: usize,
    /// Left claimed for the liveness sweep (shutdown or store error).
    pub left_claimed: usize,
    /// Outcome not recorded because the claim had already been swept.
    pub lost: usize,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }

    fn absorb(&mut self, group: CycleReport) {
        self.dispatched += group.dispatched;
        self.stale += group.stale;
        self.failed += group.failed;
        self.dead += group.dead;
        self.released += group.released;
        self.left_claimed += group.left_claimed;
        self.lost += group.lost;
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatched={}, stale={}, failed={}, dead={}",
            self.dispatched, self.stale, self.failed, self.dead
        )
    }
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired claims returned to pending.
    pub requeued: usize,
    pub purged: usize,
    pub low_water_position: i64,
}

/// Clears the running flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One dispatcher instance. Clones share the same cycle guard.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    store: OutboxStore,
    dead_letters: DeadLetterManager,
    checkpoint: CheckpointTracker,
    worker: SyncWorker,
    infra_backoff: RetryPolicy,
    cycle_running: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: OutboxStore,
        retry_policy: RetryPolicy,
        worker: SyncWorker,
    ) -> Self {
        let checkpoint =
            CheckpointTracker::new(store.database().clone(), config.partition.clone());
        let infra_backoff = RetryPolicy {
            max_retries: u32::MAX,
            base_delay: config.infra_backoff_base,
            max_delay: config.infra_backoff_max,
            jitter_ratio: 0.0,
        };

        Self {
            dead_letters: DeadLetterManager::new(store.clone(), retry_policy),
            checkpoint,
            store,
            worker,
            infra_backoff,
            config: Arc::new(config),
            cycle_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &OutboxStore {
        &self.store
    }

    pub fn dead_letters(&self) -> &DeadLetterManager {
        &self.dead_letters
    }

    /// Poll until `shutdown` turns true or its sender is dropped.
    ///
    /// Full batches are followed immediately by another cycle; otherwise the
    /// loop sleeps for the poll interval plus jitter. Store failures back off
    /// exponentially without touching any event. Maintenance runs every
    /// `sweep_interval`, starting with the first iteration.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance_id = %self.config.instance_id,
            partition = self.checkpoint.partition_key(),
            batch_size = self.config.batch_size,
            worker_pool_size = self.config.worker_pool_size,
            "Dispatcher started"
        );

        let mut consecutive_failures: u32 = 0;
        let mut next_maintenance = Instant::now();

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            if Instant::now() >= next_maintenance {
                if let Err(e) = self.run_maintenance().await {
                    warn!(error = %e, "Outbox maintenance failed");
                }
                next_maintenance = Instant::now() + self.config.sweep_interval;
            }

            let delay = match self.run_cycle(&shutdown).await {
                Ok(report) => {
                    consecutive_failures = 0;
                    if !report.is_empty() {
                        info!(
                            instance_id = %self.config.instance_id,
                            claimed = report.claimed,
                            released = report.released,
                            left_claimed = report.left_claimed,
                            "sync cycle completed: {}",
                            report
                        );
                    }
                    if report.claimed >= self.config.batch_size {
                        Duration::ZERO
                    } else {
                        self.config.poll_delay()
                    }
                }
                Err(DispatchError::Shutdown) => break,
                Err(DispatchError::CycleInProgress) => self.config.poll_delay(),
                Err(e) => {
                    let delay = self.infra_backoff.backoff_delay(consecutive_failures);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    error!(
                        error = %e,
                        consecutive_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Dispatch cycle failed, backing off"
                    );
                    delay
                }
            };

            if delay.is_zero() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            instance_id = %self.config.instance_id,
            "Dispatcher stopped"
        );
    }

    /// Claim one batch and apply it.
    ///
    /// Refuses to start while another cycle of this dispatcher is running.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> DispatchResult<CycleReport> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous dispatch cycle still running, skipping");
            return Err(DispatchError::CycleInProgress);
        }
        let _guard = CycleGuard(&self.cycle_running);

        let stopping = *shutdown.borrow();
        if stopping {
            return Err(DispatchError::Shutdown);
        }

        let span = info_span!("cycle", instance_id = %self.config.instance_id);
        self.claim_and_apply(shutdown.clone()).instrument(span).await
    }

    async fn claim_and_apply(&self, shutdown: watch::Receiver<bool>) -> DispatchResult<CycleReport> {
        let floor = self.checkpoint.scan_floor().await?;
        let batch = self
            .store
            .claim_batch(
                self.config.batch_size,
                self.config.partition.as_deref(),
                floor,
                &self.config.instance_id,
            )
            .await?;

        if batch.is_empty() {
            return Ok(CycleReport::default());
        }

        let mut report = CycleReport {
            claimed: batch.len(),
            ..Default::default()
        };
        let claim_token: Arc<str> = Arc::from(batch.claim_token.as_str());
        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size.max(1)));
        let mut tasks = JoinSet::new();

        for (key, events) in group_by_aggregate(batch.events) {
            let dispatcher = self.clone();
            let semaphore = semaphore.clone();
            let claim_token = claim_token.clone();
            let shutdown = shutdown.clone();
            let span = info_span!("apply", aggregate = %key);

            tasks.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return CycleReport {
                            left_claimed: events.len(),
                            ..Default::default()
                        };
                    };
                    dispatcher
                        .process_group(&claim_token, events, &shutdown)
                        .await
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(group) => report.absorb(group),
                Err(e) => error!(error = %e, "Aggregate sync task failed; its claims will expire"),
            }
        }

        Ok(report)
    }

    /// Apply one aggregate's events in sequence order.
    ///
    /// Stops at the first failure and releases the rest of the group so it
    /// does not wait for the liveness sweep.
    async fn process_group(
        &self,
        claim_token: &str,
        events: Vec<OutboxEvent>,
        shutdown: &watch::Receiver<bool>,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        let mut remaining = events.into_iter();

        while let Some(event) = remaining.next() {
            let stopping = *shutdown.borrow();
            if stopping {
                report.left_claimed += 1 + remaining.len();
                break;
            }

            // Renew the claim on everything this group still holds, so the
            // liveness window covers one apply rather than the whole batch.
            let held = 1 + remaining.len();
            let mut ids = Vec::with_capacity(held);
            ids.push(event.event_id.clone());
            ids.extend(remaining.as_slice().iter().map(|e| e.event_id.clone()));
            match self.store.renew_claims(ids.clone(), claim_token).await {
                Ok(renewed) if renewed == held => {}
                Ok(renewed) => {
                    warn!(
                        aggregate = %event.key(),
                        renewed,
                        held,
                        "Claim expired before the group was applied"
                    );
                    let released = match self.store.release(ids, claim_token).await {
                        Ok(released) => released,
                        Err(e) => {
                            warn!(error = %e, "Failed to release partially lost group");
                            0
                        }
                    };
                    report.released += released;
                    report.lost += held.saturating_sub(released);
                    break;
                }
                Err(e) => {
                    error!(aggregate = %event.key(), error = %e, "Failed to renew claim");
                    report.left_claimed += held;
                    break;
                }
            }

            let outcome = match timeout(self.config.apply_timeout, self.worker.apply(&event)).await {
                Ok(outcome) => outcome,
                Err(_) => SyncOutcome::TransientFailure(format!(
                    "index write timed out after {}ms",
                    self.config.apply_timeout.as_millis()
                )),
            };

            let Some((kind, message)) = outcome.failure() else {
                match self
                    .store
                    .mark_dispatched(vec![event.event_id.clone()], claim_token)
                    .await
                {
                    Ok(1) => {
                        if matches!(outcome, SyncOutcome::StaleSkip { .. }) {
                            report.stale += 1;
                        } else {
                            report.dispatched += 1;
                        }
                    }
                    Ok(_) => {
                        warn!(
                            event_id = %event.event_id,
                            "Claim expired before dispatch was recorded"
                        );
                        report.lost += 1 + remaining.len();
                        break;
                    }
                    Err(e) => {
                        error!(
                            event_id = %event.event_id,
                            error = %e,
                            "Failed to mark event dispatched"
                        );
                        report.left_claimed += 1 + remaining.len();
                        break;
                    }
                }
                continue;
            };

            match self
                .dead_letters
                .handle_failure(&event, claim_token, kind, message)
                .await
            {
                Ok(FailureDisposition::Retrying { .. }) => report.failed += 1,
                Ok(FailureDisposition::DeadLettered { .. }) => report.dead += 1,
                Ok(FailureDisposition::ClaimLost) => {
                    report.lost += 1 + remaining.len();
                    break;
                }
                Err(e) => {
                    error!(
                        event_id = %event.event_id,
                        error = %e,
                        "Failed to record sync failure"
                    );
                    report.left_claimed += 1 + remaining.len();
                    break;
                }
            }

            let held: Vec<String> = remaining.by_ref().map(|e| e.event_id).collect();
            if !held.is_empty() {
                let count = held.len();
                match self.store.release(held, claim_token).await {
                    Ok(released) => report.released += released,
                    Err(e) => {
                        warn!(error = %e, count, "Failed to release held events");
                        report.left_claimed += count;
                    }
                }
            }
            break;
        }

        report
    }

    /// Liveness sweep, retention purge and checkpoint update.
    pub async fn run_maintenance(&self) -> DispatchResult<MaintenanceReport> {
        let requeued = self
            .store
            .sweep_expired_claims(self.config.claim_liveness_timeout)
            .await?;
        if requeued > 0 {
            warn!(
                requeued,
                timeout_secs = self.config.claim_liveness_timeout.as_secs(),
                "Requeued claims that exceeded the liveness timeout"
            );
        }

        let purged = match self.config.retention {
            Some(retention) => self.store.purge_dispatched(retention).await?,
            None => 0,
        };

        let checkpoint = self.checkpoint.advance().await?;

        Ok(MaintenanceReport {
            requeued,
            purged,
            low_water_position: checkpoint.low_water_position,
        })
    }
}

/// Split a claimed batch into per-aggregate groups in sequence order.
fn group_by_aggregate(events: Vec<OutboxEvent>) -> BTreeMap<AggregateKey, Vec<OutboxEvent>> {
    let mut groups: BTreeMap<AggregateKey, Vec<OutboxEvent>> = BTreeMap::new();
    for event in events {
        groups.entry(event.key()).or_default().push(event);
    }
    for events in groups.values_mut() {
        events.sort_by_key(|event| event.sequence_number);
    }
    groups
}
