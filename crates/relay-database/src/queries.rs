//! Query helpers for the outbox tables.
//!
//! Every function takes a plain `&Connection`, so it works both on a bare
//! connection and on a `rusqlite::Transaction` (which derefs to one). The
//! functions that must be atomic with other statements say so; callers run
//! them through `AsyncDatabase::transaction`.

use crate::{
    AppendedEvent, ClaimRequest, DatabaseError, DatabaseResult, FailureUpdate, NewOutboxEvent,
    OutboxEvent, OutboxStats, OutboxStatus, SyncCheckpoint,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row, ToSql};
use tracing::warn;
use uuid::Uuid;

const OUTBOX_COLUMNS: &str = "position, event_id, aggregate_type, aggregate_id, sequence_number, \
     event_type, payload, status, retry_count, next_attempt_at, last_error, claim_token, \
     claimed_by, claimed_at, created_at, dispatched_at";

// ==========================================
// Sequencer
// ==========================================

/// Issue the next sequence number for an aggregate.
///
/// Backed by the persisted `aggregate_sequences` counter, so numbers keep
/// increasing across restarts and purges. Must share a transaction with the
/// insert that uses the number.
pub fn next_sequence(
    conn: &Connection,
    aggregate_type: &str,
    aggregate_id: &str,
) -> DatabaseResult<i64> {
    let sequence = conn.query_row(
        "INSERT INTO aggregate_sequences (aggregate_type, aggregate_id, last_sequence)
         VALUES (?1, ?2, 1)
         ON CONFLICT (aggregate_type, aggregate_id)
         DO UPDATE SET last_sequence = last_sequence + 1
         RETURNING last_sequence",
        params![aggregate_type, aggregate_id],
        |row| row.get(0),
    )?;
    Ok(sequence)
}

/// Current counter value for an aggregate (0 if it never had an event).
pub fn current_sequence(
    conn: &Connection,
    aggregate_type: &str,
    aggregate_id: &str,
) -> DatabaseResult<i64> {
    let sequence: Option<i64> = match conn.query_row(
        "SELECT last_sequence FROM aggregate_sequences
         WHERE aggregate_type = ?1 AND aggregate_id = ?2",
        params![aggregate_type, aggregate_id],
        |row| row.get(0),
    ) {
        Ok(seq) => Some(seq),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };
    Ok(sequence.unwrap_or(0))
}

// ==========================================
// Outbox append
// ==========================================

/// Append one pending event, assigning its id and sequence number.
///
/// Run this inside the business transaction: the sequence bump and the
/// insert commit or roll back together with the caller's own writes.
pub fn insert_outbox_event(
    conn: &Connection,
    event: &NewOutboxEvent,
    now: DateTime<Utc>,
) -> DatabaseResult<AppendedEvent> {
    let sequence_number = next_sequence(conn, &event.aggregate_type, &event.aggregate_id)?;
    let event_id = Uuid::new_v4().to_string();
    let now_ms = timestamp_ms(now);

    conn.execute(
        "INSERT INTO outbox_events
            (event_id, aggregate_type, aggregate_id, sequence_number, event_type, payload,
             status, retry_count, next_attempt_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?7)",
        params![
            event_id,
            event.aggregate_type,
            event.aggregate_id,
            sequence_number,
            event.event_type.as_str(),
            event.payload,
            now_ms,
        ],
    )?;

    Ok(AppendedEvent {
        event_id,
        sequence_number,
        position: conn.last_insert_rowid(),
    })
}

// ==========================================
// Claim protocol
// ==========================================

/// Claim up to `request.limit` deliverable events.
///
/// Deliverable means `pending`, or `failed` with an elapsed `next_attempt_at`,
/// and not held behind an earlier event of the same aggregate that is still
/// in flight (`claimed`), backing off (`failed`, not yet due) or quarantined
/// (`dead`). Results are ordered by aggregate then sequence, so a batch never
/// contains a later event without the earlier deliverable ones.
///
/// Must run inside an IMMEDIATE transaction: the select and the conditional
/// update together are the claim.
pub fn claim_outbox_batch(
    conn: &Connection,
    request: &ClaimRequest,
) -> DatabaseResult<Vec<OutboxEvent>> {
    if request.limit == 0 {
        return Ok(Vec::new());
    }

    let now_ms = timestamp_ms(request.now);
    let sql = format!(
        "SELECT {OUTBOX_COLUMNS}
         FROM outbox_events e
         WHERE e.position >= ?1
           AND (?2 IS NULL OR e.aggregate_type = ?2)
           AND (e.status = 'pending' OR (e.status = 'failed' AND e.next_attempt_at <= ?3))
           AND NOT EXISTS (
               SELECT 1 FROM outbox_events p
               WHERE p.aggregate_type = e.aggregate_type
                 AND p.aggregate_id = e.aggregate_id
                 AND p.sequence_number < e.sequence_number
                 AND (p.status IN ('claimed', 'dead')
                      OR (p.status = 'failed' AND p.next_attempt_at > ?3))
           )
         ORDER BY e.aggregate_type, e.aggregate_id, e.sequence_number
         LIMIT ?4"
    );

    let mut events = {
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    request.min_position,
                    request.partition,
                    now_ms,
                    request.limit as i64
                ],
                map_outbox_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    if events.is_empty() {
        return Ok(events);
    }

    let sql = format!(
        "UPDATE outbox_events
         SET status = 'claimed', claim_token = ?1, claimed_by = ?2, claimed_at = ?3
         WHERE status IN ('pending', 'failed') AND position IN ({})",
        numbered_placeholders(4, events.len())
    );

    let positions: Vec<i64> = events.iter().map(|e| e.position).collect();
    let mut params_vec: Vec<&dyn ToSql> = Vec::with_capacity(positions.len() + 3);
    params_vec.push(&request.claim_token);
    params_vec.push(&request.claimed_by);
    params_vec.push(&now_ms);
    for position in &positions {
        params_vec.push(position);
    }

    let updated = conn.execute(&sql, params_vec.as_slice())?;
    if updated != events.len() {
        // Only possible when the caller forgot the surrounding transaction.
        return Err(DatabaseError::InvalidData(format!(
            "claimed {updated} of {} selected events",
            events.len()
        )));
    }

    for event in &mut events {
        event.status = OutboxStatus::Claimed;
        event.claim_token = Some(request.claim_token.clone());
        event.claimed_by = Some(request.claimed_by.clone());
        event.claimed_at = Some(datetime_from_ms(now_ms));
    }

    Ok(events)
}

/// Mark claimed events dispatched. Only rows still held under `claim_token`
/// change; returns how many did.
pub fn mark_dispatched(
    conn: &Connection,
    event_ids: &[String],
    claim_token: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    if event_ids.is_empty() {
        return Ok(0);
    }

    let now_ms = timestamp_ms(now);
    let sql = format!(
        "UPDATE outbox_events
         SET status = 'dispatched', dispatched_at = ?1, claim_token = NULL, last_error = NULL
         WHERE status = 'claimed' AND claim_token = ?2 AND event_id IN ({})",
        numbered_placeholders(3, event_ids.len())
    );

    let mut params_vec: Vec<&dyn ToSql> = Vec::with_capacity(event_ids.len() + 2);
    params_vec.push(&now_ms);
    params_vec.push(&claim_token);
    for id in event_ids {
        params_vec.push(id);
    }

    Ok(conn.execute(&sql, params_vec.as_slice())?)
}

/// Refresh `claimed_at` on rows still held under `claim_token`, so the
/// liveness sweep measures time since the last sign of progress. Returns how
/// many rows were renewed.
pub fn touch_claims(
    conn: &Connection,
    event_ids: &[String],
    claim_token: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    if event_ids.is_empty() {
        return Ok(0);
    }

    let now_ms = timestamp_ms(now);
    let sql = format!(
        "UPDATE outbox_events
         SET claimed_at = ?1
         WHERE status = 'claimed' AND claim_token = ?2 AND event_id IN ({})",
        numbered_placeholders(3, event_ids.len())
    );

    let mut params_vec: Vec<&dyn ToSql> = Vec::with_capacity(event_ids.len() + 2);
    params_vec.push(&now_ms);
    params_vec.push(&claim_token);
    for id in event_ids {
        params_vec.push(id);
    }

    Ok(conn.execute(&sql, params_vec.as_slice())?)
}

/// Persist a failed attempt (`failed` for retry or `dead`). Returns false if
/// the claim was lost to the liveness sweep in the meantime.
pub fn record_failure(
    conn: &Connection,
    event_id: &str,
    claim_token: &str,
    update: &FailureUpdate,
) -> DatabaseResult<bool> {
    if !matches!(update.status, OutboxStatus::Failed | OutboxStatus::Dead) {
        return Err(DatabaseError::InvalidData(format!(
            "cannot record a failure as status '{}'",
            update.status
        )));
    }

    let count = conn.execute(
        "UPDATE outbox_events
         SET status = ?1, retry_count = ?2, next_attempt_at = ?3, last_error = ?4,
             claim_token = NULL, claimed_at = NULL
         WHERE event_id = ?5 AND status = 'claimed' AND claim_token = ?6",
        params![
            update.status.as_str(),
            update.retry_count,
            timestamp_ms(update.next_attempt_at),
            update.last_error,
            event_id,
            claim_token,
        ],
    )?;
    Ok(count == 1)
}

/// Return claimed events to `pending` without touching their retry budget.
pub fn release_claims(
    conn: &Connection,
    event_ids: &[String],
    claim_token: &str,
) -> DatabaseResult<usize> {
    if event_ids.is_empty() {
        return Ok(0);
    }

    let sql = format!(
        "UPDATE outbox_events
         SET status = 'pending', claim_token = NULL, claimed_by = NULL, claimed_at = NULL
         WHERE status = 'claimed' AND claim_token = ?1 AND event_id IN ({})",
        numbered_placeholders(2, event_ids.len())
    );

    let mut params_vec: Vec<&dyn ToSql> = Vec::with_capacity(event_ids.len() + 1);
    params_vec.push(&claim_token);
    for id in event_ids {
        params_vec.push(id);
    }

    Ok(conn.execute(&sql, params_vec.as_slice())?)
}

/// Liveness sweep: claims taken before `claimed_before` go back to `pending`.
pub fn requeue_expired_claims(
    conn: &Connection,
    claimed_before: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'pending', claim_token = NULL, claimed_by = NULL, claimed_at = NULL
         WHERE status = 'claimed' AND claimed_at < ?1",
        params![timestamp_ms(claimed_before)],
    )?;
    if count > 0 {
        warn!(count, "Requeued expired outbox claims");
    }
    Ok(count)
}

// ==========================================
// Inspection
// ==========================================

/// Get a single event by id.
pub fn get_outbox_event(conn: &Connection, event_id: &str) -> DatabaseResult<Option<OutboxEvent>> {
    let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE event_id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;

    match stmt.query_row(params![event_id], map_outbox_row) {
        Ok(event) => Ok(Some(event)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List events with `status`, oldest first.
pub fn list_outbox_events(
    conn: &Connection,
    status: OutboxStatus,
    limit: usize,
) -> DatabaseResult<Vec<OutboxEvent>> {
    let sql = format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_events
         WHERE status = ?1
         ORDER BY position ASC
         LIMIT ?2"
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    let events = stmt
        .query_map(params![status.as_str(), limit as i64], map_outbox_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

/// All retained events of one aggregate in sequence order.
pub fn list_aggregate_events(
    conn: &Connection,
    aggregate_type: &str,
    aggregate_id: &str,
) -> DatabaseResult<Vec<OutboxEvent>> {
    let sql = format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_events
         WHERE aggregate_type = ?1 AND aggregate_id = ?2
         ORDER BY sequence_number ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    let events = stmt
        .query_map(params![aggregate_type, aggregate_id], map_outbox_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Counts per status plus the age of the oldest undelivered event.
pub fn outbox_stats(conn: &Connection, now: DateTime<Utc>) -> DatabaseResult<OutboxStats> {
    let mut stats = OutboxStats::default();

    let mut stmt =
        conn.prepare_cached("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (status, count) in counts {
        stats.set_count(status.parse()?, count.max(0) as u64);
    }

    let oldest: Option<i64> = conn.query_row(
        "SELECT MIN(created_at) FROM outbox_events
         WHERE status IN ('pending', 'claimed', 'failed')",
        [],
        |row| row.get(0),
    )?;
    if let Some(ms) = oldest {
        let created = datetime_from_ms(ms);
        stats.oldest_undispatched_at = Some(created);
        stats.staleness_secs = Some((now - created).num_seconds().max(0));
    }

    Ok(stats)
}

// ==========================================
// Dead letters
// ==========================================

/// Move a dead event back to `pending` with a fresh retry budget. Returns the
/// event's position, or `None` if it is not dead.
pub fn requeue_dead_event(
    conn: &Connection,
    event_id: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<Option<i64>> {
    match conn.query_row(
        "UPDATE outbox_events
         SET status = 'pending', retry_count = 0, next_attempt_at = ?1,
             claim_token = NULL, claimed_by = NULL, claimed_at = NULL
         WHERE event_id = ?2 AND status = 'dead'
         RETURNING position",
        params![timestamp_ms(now), event_id],
        |row| row.get(0),
    ) {
        Ok(position) => Ok(Some(position)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Permanently remove a dead event, releasing any events held behind it.
pub fn delete_dead_event(conn: &Connection, event_id: &str) -> DatabaseResult<bool> {
    let count = conn.execute(
        "DELETE FROM outbox_events WHERE event_id = ?1 AND status = 'dead'",
        params![event_id],
    )?;
    Ok(count > 0)
}

/// Retention cleanup of dispatched rows.
pub fn purge_dispatched(conn: &Connection, dispatched_before: DateTime<Utc>) -> DatabaseResult<usize> {
    let count = conn.execute(
        "DELETE FROM outbox_events WHERE status = 'dispatched' AND dispatched_at < ?1",
        params![timestamp_ms(dispatched_before)],
    )?;
    Ok(count)
}

// ==========================================
// Checkpoints
// ==========================================

/// Get the checkpoint for a partition key.
pub fn get_checkpoint(conn: &Connection, partition: &str) -> DatabaseResult<Option<SyncCheckpoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT partition, low_water_position, last_dispatched_position, updated_at
         FROM sync_checkpoints WHERE partition = ?1",
    )?;

    match stmt.query_row(params![partition], |row| {
        Ok(SyncCheckpoint {
            partition: row.get(0)?,
            low_water_position: row.get(1)?,
            last_dispatched_position: row.get(2)?,
            updated_at: datetime_from_ms(row.get(3)?),
        })
    }) {
        Ok(checkpoint) => Ok(Some(checkpoint)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Compute `(low_water_position, last_dispatched_position)` for an optional
/// aggregate-type filter.
///
/// The low-water mark is the lowest position still pending, claimed or
/// failed. With nothing outstanding it is one past the highest position, so
/// the next scan starts after everything already seen.
pub fn compute_checkpoint_positions(
    conn: &Connection,
    aggregate_type: Option<&str>,
) -> DatabaseResult<(i64, i64)> {
    let (outstanding, last_dispatched): (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT
            MIN(CASE WHEN status IN ('pending', 'claimed', 'failed') THEN position END),
            MAX(CASE WHEN status = 'dispatched' THEN position END)
         FROM outbox_events
         WHERE ?1 IS NULL OR aggregate_type = ?1",
        params![aggregate_type],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let low_water = match outstanding {
        Some(position) => position,
        None => {
            let max: Option<i64> =
                conn.query_row("SELECT MAX(position) FROM outbox_events", [], |row| row.get(0))?;
            max.map(|p| p + 1).unwrap_or(0)
        }
    };

    Ok((low_water, last_dispatched.unwrap_or(0)))
}

/// Insert or update a checkpoint. `last_dispatched_position` never moves back.
pub fn upsert_checkpoint(
    conn: &Connection,
    partition: &str,
    low_water_position: i64,
    last_dispatched_position: i64,
    now: DateTime<Utc>,
) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO sync_checkpoints
            (partition, low_water_position, last_dispatched_position, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (partition) DO UPDATE SET
            low_water_position = excluded.low_water_position,
            last_dispatched_position =
                MAX(last_dispatched_position, excluded.last_dispatched_position),
            updated_at = excluded.updated_at",
        params![
            partition,
            low_water_position,
            last_dispatched_position,
            timestamp_ms(now)
        ],
    )?;
    Ok(())
}

/// Pull every checkpoint above `position` down to it, so a requeued event
/// is inside the next scan window.
pub fn lower_checkpoints(
    conn: &Connection,
    position: i64,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE sync_checkpoints
         SET low_water_position = ?1, updated_at = ?2
         WHERE low_water_position > ?1",
        params![position, timestamp_ms(now)],
    )?;
    Ok(count)
}

// ==========================================
// Helpers
// ==========================================

fn map_outbox_row(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    let status: String = row.get(7)?;
    let status = status
        .parse::<OutboxStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

    Ok(OutboxEvent {
        position: row.get(0)?,
        event_id: row.get(1)?,
        aggregate_type: row.get(2)?,
        aggregate_id: row.get(3)?,
        sequence_number: row.get(4)?,
        event_type: row.get::<_, String>(5)?.into(),
        payload: row.get(6)?,
        status,
        retry_count: row.get(8)?,
        next_attempt_at: datetime_from_ms(row.get(9)?),
        last_error: row.get(10)?,
        claim_token: row.get(11)?,
        claimed_by: row.get(12)?,
        claimed_at: row.get::<_, Option<i64>>(13)?.map(datetime_from_ms),
        created_at: datetime_from_ms(row.get(14)?),
        dispatched_at: row.get::<_, Option<i64>>(15)?.map(datetime_from_ms),
    })
}

/// `?start, ?start+1, ...` for an IN list of `count` values.
fn numbered_placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn timestamp_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn datetime_from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
