//! `dead`: list, requeue and discard dead-lettered events.

use super::open_store;
use crate::output::{self, OutputFormat};
use crate::settings;
use relay_config_and_utils::{Config, Paths};
use relay_outbox::DeadLetterManager;

async fn manager(config: &Config, paths: &Paths) -> anyhow::Result<DeadLetterManager> {
    let store = open_store(config, paths).await?;
    Ok(DeadLetterManager::new(store, settings::retry_policy(&config.retry)))
}

pub async fn dead_list(
    config: &Config,
    paths: &Paths,
    limit: usize,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let events = manager(config, paths).await?.list(limit).await?;

    match format {
        OutputFormat::Json => output::print_json(&events)?,
        OutputFormat::Text => {
            if events.is_empty() {
                println!("No dead events.");
                return Ok(());
            }

            println!(
                "{:<36}  {:<24}  {:>5}  {:>7}  {:<19}  ERROR",
                "EVENT ID", "AGGREGATE", "SEQ", "RETRIES", "CREATED"
            );
            for event in &events {
                println!(
                    "{:<36}  {:<24}  {:>5}  {:>7}  {:<19}  {}",
                    event.event_id,
                    output::truncate(&event.key().to_string(), 24),
                    event.sequence_number,
                    event.retry_count,
                    event.created_at.format("%Y-%m-%d %H:%M:%S"),
                    output::truncate(event.last_error.as_deref().unwrap_or("-"), 60),
                );
            }
            println!("\n{} dead event(s)", events.len());
        }
    }

    Ok(())
}

pub async fn dead_requeue(
    config: &Config,
    paths: &Paths,
    event_id: &str,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    manager(config, paths).await?.requeue(event_id).await?;
    output::print_success(&format!("Requeued event {}", event_id), format);
    Ok(())
}

pub async fn dead_discard(
    config: &Config,
    paths: &Paths,
    event_id: &str,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    manager(config, paths).await?.discard(event_id).await?;
    output::print_success(&format!("Discarded event {}", event_id), format);
    Ok(())
}
