//! Outbox dispatcher.
//!
//! Each [`Dispatcher`] instance polls the outbox, claims a bounded batch,
//! groups it by aggregate and applies every group through the sync worker.
//! Groups run in parallel up to `worker_pool_size`; events inside a group
//! run one after another in sequence order, and a failure stops its group.
//!
//! Any number of instances, in one process or several, may share an outbox
//! database. The claim is the only coordination between them.
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(config, store, RetryPolicy::default(), worker);
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });
//! // ...
//! shutdown_tx.send(true)?;
//! handle.await?;
//! ```

mod config;
mod dispatcher;
mod error;

pub use config::DispatcherConfig;
pub use dispatcher::{CycleReport, Dispatcher, MaintenanceReport};
pub use error::{DispatchError, DispatchResult};
