//! Transactional outbox for search-index propagation.
//!
//! - [`OutboxStore`]: append inside the business transaction, claim batches,
//!   and record outcomes under a claim token.
//! - [`OutboxTransaction`]: the explicit transaction scope handed to
//!   business code.
//! - [`RetryPolicy`]: exponential backoff with jitter and a retry budget.
//! - [`DeadLetterManager`]: applies the policy to failed attempts and exposes
//!   operator list/requeue/discard over dead events.
//! - [`CheckpointTracker`]: per-partition low-water mark that bounds claim
//!   scans after a restart.

mod checkpoint;
mod dead_letter;
mod error;
mod retry;
mod store;
mod transaction;

pub use checkpoint::{CheckpointTracker, ALL_PARTITIONS};
pub use dead_letter::{DeadLetterManager, FailureDisposition};
pub use error::{OutboxError, OutboxResult};
pub use retry::{FailureDecision, FailureKind, RetryPolicy};
pub use store::{ClaimedBatch, OutboxStore};
pub use transaction::OutboxTransaction;

pub use relay_database::{
    AggregateKey, AppendedEvent, EventType, NewOutboxEvent, OutboxEvent, OutboxStats,
    OutboxStatus, SyncCheckpoint,
};
