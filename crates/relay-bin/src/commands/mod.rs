//! CLI command implementations.

mod dead;
mod history;
mod init;
mod maintenance;
mod run;
mod stats;

pub use dead::{dead_discard, dead_list, dead_requeue};
pub use history::history;
pub use init::init;
pub use maintenance::{purge, sweep};
pub use run::run;
pub use stats::stats;

use relay_config_and_utils::{Config, Paths};
use relay_database::AsyncDatabase;
use relay_outbox::OutboxStore;

/// Open the configured outbox database.
async fn open_store(config: &Config, paths: &Paths) -> anyhow::Result<OutboxStore> {
    let db = AsyncDatabase::open(&config.database_path(paths)).await?;
    Ok(OutboxStore::new(db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use relay_outbox::{EventType, NewOutboxEvent, OutboxStatus};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_operator_commands_against_fresh_database() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        paths.ensure_dirs().unwrap();
        let config = Config::default();

        let store = open_store(&config, &paths).await.unwrap();
        store
            .append(NewOutboxEvent::new("order", "42", EventType::Created, "{}"))
            .await
            .unwrap();
        assert!(config.database_path(&paths).exists());

        stats(&config, &paths, &OutputFormat::Json).await.unwrap();
        history(&config, &paths, "order", "42", &OutputFormat::Text)
            .await
            .unwrap();
        sweep(&config, &paths, &OutputFormat::Text).await.unwrap();
        dead_list(&config, &paths, 10, &OutputFormat::Text).await.unwrap();
        assert!(dead_requeue(&config, &paths, "missing", &OutputFormat::Text)
            .await
            .is_err());

        let pending = store.list(OutboxStatus::Pending, 10).await.unwrap();
        assert!(dead_discard(&config, &paths, &pending[0].event_id, &OutputFormat::Json)
            .await
            .is_err());
    }
}
