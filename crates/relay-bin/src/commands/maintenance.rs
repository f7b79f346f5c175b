//! `sweep` and `purge`: one-off maintenance outside the dispatcher loop.

use super::open_store;
use crate::output::{self, OutputFormat};
use crate::settings;
use relay_config_and_utils::{Config, Paths};
use relay_outbox::CheckpointTracker;
use std::time::Duration;

pub async fn sweep(config: &Config, paths: &Paths, format: &OutputFormat) -> anyhow::Result<()> {
    let store = open_store(config, paths).await?;
    let liveness = Duration::from_secs(config.dispatcher.claim_liveness_timeout_secs);
    let requeued = store.sweep_expired_claims(liveness).await?;

    let tracker = CheckpointTracker::new(store.database().clone(), config.dispatcher.partition.clone());
    let checkpoint = tracker.advance().await?;

    output::print_success(
        &format!(
            "Requeued {} expired claim(s); low water for {} is {}",
            requeued,
            checkpoint.partition,
            checkpoint.low_water_position
        ),
        format,
    );
    Ok(())
}

pub async fn purge(
    config: &Config,
    paths: &Paths,
    older_than_hours: Option<u64>,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let hours = older_than_hours.unwrap_or(config.dispatcher.retention_hours);
    let Some(retention) = settings::retention(hours) else {
        anyhow::bail!("retention is disabled; pass --older-than-hours to purge anyway");
    };

    let store = open_store(config, paths).await?;
    let purged = store.purge_dispatched(retention).await?;
    output::print_success(
        &format!("Purged {} dispatched event(s) older than {}h", purged, hours),
        format,
    );
    Ok(())
}
