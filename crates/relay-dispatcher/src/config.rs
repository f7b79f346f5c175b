use rand::Rng;
use std::time::Duration;

/// Runtime settings of one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Recorded as `claimed_by` on every claimed row.
    pub instance_id: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Up to this much is added to each idle poll.
    pub poll_jitter: Duration,
    /// Aggregates applied concurrently within one batch.
    pub worker_pool_size: usize,
    pub claim_liveness_timeout: Duration,
    /// Interval between liveness sweeps, retention purges and checkpoint
    /// updates.
    pub sweep_interval: Duration,
    /// Upper bound on one event's index write.
    pub apply_timeout: Duration,
    /// Only claim events of this aggregate type.
    pub partition: Option<String>,
    pub infra_backoff_base: Duration,
    pub infra_backoff_max: Duration,
    /// `None` keeps dispatched rows forever.
    pub retention: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("relay-{}", std::process::id()),
            batch_size: 100,
            poll_interval: Duration::from_secs(3),
            poll_jitter: Duration::from_millis(250),
            worker_pool_size: 8,
            claim_liveness_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            apply_timeout: Duration::from_secs(10),
            partition: None,
            infra_backoff_base: Duration::from_secs(1),
            infra_backoff_max: Duration::from_secs(60),
            retention: Some(Duration::from_secs(72 * 3600)),
        }
    }
}

impl DispatcherConfig {
    /// Idle sleep: the poll interval plus uniform jitter.
    pub fn poll_delay(&self) -> Duration {
        let jitter_ms = self.poll_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        self.poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
