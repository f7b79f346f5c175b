//! SQLite persistence for the transactional outbox.
//!
//! This crate provides:
//! - The `outbox_events` table and its migrations
//! - The persisted per-aggregate sequence counter
//! - Per-partition sync checkpoints
//! - Row-level query helpers (`queries`)
//! - An async executor with a dedicated SQLite thread and an explicit
//!   transaction scope
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let stats = db.call(|conn| queries::outbox_stats(conn, Utc::now())).await?;
//! ```
//!
//! Only SQL should run inside `db.call()` / `db.transaction()`. Network
//! calls and heavy work happen outside, on the async side.

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
