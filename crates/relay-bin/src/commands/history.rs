//! `history`: one aggregate's retained events.

use super::open_store;
use crate::output::{self, OutputFormat};
use relay_config_and_utils::{Config, Paths};

pub async fn history(
    config: &Config,
    paths: &Paths,
    aggregate_type: &str,
    aggregate_id: &str,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let store = open_store(config, paths).await?;
    let events = store.aggregate_history(aggregate_type, aggregate_id).await?;

    match format {
        OutputFormat::Json => output::print_json(&events)?,
        OutputFormat::Text => {
            if events.is_empty() {
                println!("No retained events for {}/{}.", aggregate_type, aggregate_id);
                return Ok(());
            }

            println!(
                "{:>5}  {:<16}  {:<10}  {:>7}  {:<19}  ERROR",
                "SEQ", "TYPE", "STATUS", "RETRIES", "CREATED"
            );
            for event in &events {
                println!(
                    "{:>5}  {:<16}  {:<10}  {:>7}  {:<19}  {}",
                    event.sequence_number,
                    event.event_type.to_string(),
                    event.status.as_str(),
                    event.retry_count,
                    event.created_at.format("%Y-%m-%d %H:%M:%S"),
                    output::truncate(event.last_error.as_deref().unwrap_or("-"), 60),
                );
            }
        }
    }

    Ok(())
}
