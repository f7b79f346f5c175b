//! # index-sync-worker
//!
//! Applies one claimed outbox event to the search index.
//!
//! ```text
//! OutboxEvent ──▶ DocumentMapper ──▶ IndexMutation ──▶ SearchIndex (version guard)
//!                                                          │
//!                                            SyncOutcome ◀─┘
//! ```
//!
//! The document id is the aggregate id, the logical index is the aggregate
//! type, and the document version is the event's sequence number. Every write
//! is conditional on that version, so applying an event twice, or after a
//! later event has landed, reports [`SyncOutcome::StaleSkip`] instead of
//! changing the index.
//!
//! The worker never touches the outbox; the dispatcher turns the returned
//! [`SyncOutcome`] into a status change.

mod error;
mod mapper;
mod worker;

pub use error::{MappingError, SyncError};
pub use mapper::{DocumentMapper, IndexMutation, JsonSnapshotMapper};
pub use worker::{SyncOutcome, SyncWorker};
