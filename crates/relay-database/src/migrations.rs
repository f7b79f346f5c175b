//! Database migrations.
//!
//! Migrations are run in order on open and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_aggregate_sequences(conn)?;
    }
    if current_version < 3 {
        migrate_v3_sync_checkpoints(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: the outbox log.
///
/// `position` is the global append order. Timestamps are unix milliseconds.
fn migrate_v1_outbox_events(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_events (
            position INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            sequence_number INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'claimed', 'failed', 'dispatched', 'dead')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            last_error TEXT,
            claim_token TEXT,
            claimed_by TEXT,
            claimed_at INTEGER,
            created_at INTEGER NOT NULL,
            dispatched_at INTEGER,
            UNIQUE (aggregate_type, aggregate_id, sequence_number)
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_events_status_next_attempt
            ON outbox_events(status, next_attempt_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_events_claim_token
            ON outbox_events(claim_token) WHERE claim_token IS NOT NULL;
        ",
    )?;

    record_migration(conn, 1, "outbox_events")?;
    Ok(())
}

/// V2: persisted per-aggregate sequence counter.
///
/// Kept apart from `outbox_events` so purging dispatched rows never lets a
/// sequence number be reissued.
fn migrate_v2_aggregate_sequences(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS aggregate_sequences (
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            last_sequence INTEGER NOT NULL,
            PRIMARY KEY (aggregate_type, aggregate_id)
        ) WITHOUT ROWID;
        ",
    )?;

    record_migration(conn, 2, "aggregate_sequences")?;
    Ok(())
}

/// V3: per-partition recovery checkpoints.
fn migrate_v3_sync_checkpoints(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_checkpoints (
            partition TEXT PRIMARY KEY,
            low_water_position INTEGER NOT NULL,
            last_dispatched_position INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );
        ",
    )?;

    record_migration(conn, 3, "sync_checkpoints")?;
    Ok(())
}
