//! `stats`: outbox counts, staleness and checkpoint.

use super::open_store;
use crate::output::{self, OutputFormat};
use relay_config_and_utils::{Config, Paths};
use relay_outbox::{CheckpointTracker, OutboxStatus};

pub async fn stats(config: &Config, paths: &Paths, format: &OutputFormat) -> anyhow::Result<()> {
    let store = open_store(config, paths).await?;
    let stats = store.stats().await?;
    let tracker = CheckpointTracker::new(store.database().clone(), config.dispatcher.partition.clone());
    let checkpoint = tracker.load().await?;

    match format {
        OutputFormat::Json => {
            output::print_json(&serde_json::json!({
                "stats": stats,
                "in_flight": stats.in_flight(),
                "checkpoint": checkpoint,
            }))?;
        }
        OutputFormat::Text => {
            output::print_heading("Outbox");
            for status in OutboxStatus::ALL {
                output::print_row(status.as_str(), &stats.count(status).to_string());
            }
            output::print_row("in flight", &stats.in_flight().to_string());
            match (stats.oldest_undispatched_at, stats.staleness_secs) {
                (Some(oldest), Some(secs)) => output::print_row(
                    "staleness",
                    &format!("{secs}s (oldest {})", oldest.format("%Y-%m-%d %H:%M:%S")),
                ),
                _ => output::print_row("staleness", "-"),
            }

            output::print_heading(&format!("Checkpoint ({})", tracker.partition_key()));
            match checkpoint {
                Some(checkpoint) => {
                    output::print_row("low water", &checkpoint.low_water_position.to_string());
                    output::print_row(
                        "last dispatched",
                        &checkpoint.last_dispatched_position.to_string(),
                    );
                    output::print_row("updated", &checkpoint.updated_at.to_rfc3339());
                }
                None => output::print_row("low water", "not recorded yet"),
            }
        }
    }

    Ok(())
}
