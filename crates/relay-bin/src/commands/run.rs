//! `run`: the long-running dispatcher.

use super::open_store;
use crate::settings;
use index_sync_worker::SyncWorker;
use relay_config_and_utils::{Config, Paths};
use relay_dispatcher::Dispatcher;
use search_index::ElasticsearchIndex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

pub async fn run(
    config: &Config,
    paths: &Paths,
    instance_id: Option<String>,
    partition: Option<String>,
) -> anyhow::Result<()> {
    let instance_id = instance_id.unwrap_or_else(default_instance_id);
    let dispatcher_config = settings::dispatcher_config(&config.dispatcher, instance_id, partition);

    let store = open_store(config, paths).await?;
    store.database().health_check().await?;
    let index = ElasticsearchIndex::new(settings::elasticsearch_config(&config.elasticsearch))?;
    let worker = SyncWorker::new(Arc::new(index));
    let dispatcher = Dispatcher::new(
        dispatcher_config,
        store.clone(),
        settings::retry_policy(&config.retry),
        worker,
    );

    let stats = store.stats().await?;
    info!(
        instance_id = %dispatcher.config().instance_id,
        partition = dispatcher.config().partition.as_deref().unwrap_or("*"),
        elasticsearch = %config.elasticsearch.url,
        %stats,
        "Starting outbox relay"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = dispatcher.clone();
    let mut handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
            }
            true
        }
        joined = &mut handle => {
            joined?;
            false
        }
    };

    if interrupted {
        info!("Shutdown requested, finishing in-flight events");
        let _ = shutdown_tx.send(true);
        handle.await?;
    }

    let stats = store.stats().await?;
    info!(%stats, "Outbox relay stopped");
    Ok(())
}

/// `<hostname>-<pid>`, unique per process on a host.
fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "relay".to_string());
    format!("{}-{}", host, std::process::id())
}
