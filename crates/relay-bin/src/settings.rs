//! Translate file configuration into runtime settings for each crate.

use relay_config_and_utils::{DispatcherSettings, ElasticsearchSettings, RetrySettings};
use relay_dispatcher::DispatcherConfig;
use relay_outbox::RetryPolicy;
use search_index::ElasticsearchConfig;
use std::time::Duration;

/// Dispatcher settings for this process. A `partition` given on the command
/// line wins over the configured one.
pub fn dispatcher_config(
    settings: &DispatcherSettings,
    instance_id: String,
    partition: Option<String>,
) -> DispatcherConfig {
    DispatcherConfig {
        instance_id,
        batch_size: settings.batch_size,
        poll_interval: Duration::from_millis(settings.poll_interval_ms),
        poll_jitter: Duration::from_millis(settings.poll_jitter_ms),
        worker_pool_size: settings.worker_pool_size,
        claim_liveness_timeout: Duration::from_secs(settings.claim_liveness_timeout_secs),
        sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
        apply_timeout: Duration::from_secs(settings.apply_timeout_secs),
        partition: partition.or_else(|| settings.partition.clone()),
        infra_backoff_base: Duration::from_millis(settings.infra_backoff_base_ms),
        infra_backoff_max: Duration::from_millis(settings.infra_backoff_max_ms),
        retention: retention(settings.retention_hours),
    }
}

/// Retention window; zero hours keeps dispatched rows forever.
pub fn retention(hours: u64) -> Option<Duration> {
    (hours > 0).then(|| Duration::from_secs(hours.saturating_mul(3600)))
}

pub fn retry_policy(settings: &RetrySettings) -> RetryPolicy {
    RetryPolicy {
        max_retries: settings.max_retries,
        base_delay: Duration::from_millis(settings.backoff_base_ms),
        max_delay: Duration::from_millis(settings.backoff_max_ms),
        jitter_ratio: settings.jitter_ratio,
    }
}

pub fn elasticsearch_config(settings: &ElasticsearchSettings) -> ElasticsearchConfig {
    ElasticsearchConfig {
        url: settings.url.clone(),
        index_prefix: settings.index_prefix.clone(),
        request_timeout: Duration::from_secs(settings.request_timeout_secs),
        username: settings.username.clone(),
        password: settings.password.clone(),
    }
}
