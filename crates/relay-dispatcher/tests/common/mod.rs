//! Shared fixtures for dispatcher integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_database::AsyncDatabase;
use relay_dispatcher::{CycleReport, Dispatcher, DispatcherConfig};
use relay_outbox::{OutboxStore, RetryPolicy};
use search_index::{
    InMemorySearchIndex, IndexDocument, IndexError, IndexResult, SearchIndex, StoredDocument,
    WriteOutcome,
};
use index_sync_worker::SyncWorker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// In-memory index with scripted failures, latency and per-write attempt
/// counting.
#[derive(Default)]
pub struct ScriptedIndex {
    inner: InMemorySearchIndex,
    failing: Mutex<HashMap<String, u16>>,
    delay: Mutex<Option<Duration>>,
    attempts: Mutex<HashMap<(String, i64), usize>>,
}

impl ScriptedIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inner(&self) -> &InMemorySearchIndex {
        &self.inner
    }

    /// Answer every write for `id` with `status`.
    pub fn fail_always(&self, id: &str, status: u16) {
        self.failing.lock().insert(id.to_string(), status);
    }

    pub fn heal(&self, id: &str) {
        self.failing.lock().remove(id);
    }

    /// Sleep this long before each write.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Write attempts for one document version.
    pub fn attempts(&self, id: &str, version: i64) -> usize {
        self.attempts
            .lock()
            .get(&(id.to_string(), version))
            .copied()
            .unwrap_or(0)
    }

    pub fn attempt_counts(&self) -> HashMap<(String, i64), usize> {
        self.attempts.lock().clone()
    }

    async fn before_write(&self, id: &str, version: i64) -> IndexResult<()> {
        *self
            .attempts
            .lock()
            .entry((id.to_string(), version))
            .or_default() += 1;

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.failing.lock().get(id).copied();
        match failing {
            Some(status) => Err(IndexError::from_status(status, "scripted failure")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SearchIndex for ScriptedIndex {
    async fn get(&self, index: &str, id: &str) -> IndexResult<Option<StoredDocument>> {
        self.inner.get(index, id).await
    }

    async fn put_if_newer(&self, document: IndexDocument) -> IndexResult<WriteOutcome> {
        self.before_write(&document.id, document.version).await?;
        self.inner.put_if_newer(document).await
    }

    async fn tombstone_if_newer(
        &self,
        index: &str,
        id: &str,
        version: i64,
    ) -> IndexResult<WriteOutcome> {
        self.before_write(id, version).await?;
        self.inner.tombstone_if_newer(index, id, version).await
    }
}

pub fn test_config(instance_id: &str) -> DispatcherConfig {
    DispatcherConfig {
        instance_id: instance_id.to_string(),
        batch_size: 50,
        poll_interval: Duration::from_millis(10),
        poll_jitter: Duration::ZERO,
        worker_pool_size: 4,
        claim_liveness_timeout: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(60),
        apply_timeout: Duration::from_secs(2),
        partition: None,
        infra_backoff_base: Duration::from_millis(10),
        infra_backoff_max: Duration::from_millis(100),
        retention: None,
    }
}

/// Retry policy with millisecond backoff and no jitter.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        jitter_ratio: 0.0,
    }
}

pub fn dispatcher(
    db: AsyncDatabase,
    index: Arc<ScriptedIndex>,
    config: DispatcherConfig,
    policy: RetryPolicy,
) -> Dispatcher {
    Dispatcher::new(config, OutboxStore::new(db), policy, SyncWorker::new(index))
}

/// Run cycles until nothing is claimable and no retry is outstanding.
pub async fn drain(dispatcher: &Dispatcher, max_cycles: usize) -> CycleReport {
    let (_tx, rx) = watch::channel(false);
    let mut total = CycleReport::default();

    for _ in 0..max_cycles {
        let report = dispatcher.run_cycle(&rx).await.unwrap();
        total.claimed += report.claimed;
        total.dispatched += report.dispatched;
        total.stale += report.stale;
        total.failed += report.failed;
        total.dead += report.dead;
        total.released += report.released;
        total.left_claimed += report.left_claimed;
        total.lost += report.lost;

        if report.is_empty() {
            let stats = dispatcher.store().stats().await.unwrap();
            if stats.failed == 0 && stats.claimed == 0 {
                return total;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    panic!("outbox did not drain within {max_cycles} cycles");
}
