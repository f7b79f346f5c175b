//! Explicit transaction scope for business writes.

use crate::OutboxResult;
use chrono::{DateTime, Utc};
use relay_database::{queries, AppendedEvent, NewOutboxEvent};
use rusqlite::Connection;

/// One open business transaction.
///
/// Obtained from [`crate::OutboxStore::write`]. Business statements go through
/// [`connection`](Self::connection); events through [`append`](Self::append).
/// Everything done through the scope commits together when the closure returns
/// `Ok`, and nothing persists when it returns `Err`.
pub struct OutboxTransaction<'a> {
    conn: &'a Connection,
    now: DateTime<Utc>,
    appended: Vec<AppendedEvent>,
}

impl<'a> OutboxTransaction<'a> {
    pub(crate) fn new(conn: &'a Connection, now: DateTime<Utc>) -> Self {
        Self {
            conn,
            now,
            appended: Vec::new(),
        }
    }

    /// The transaction's connection, for the business mutation itself.
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// Append an event in `pending` status with the aggregate's next sequence
    /// number.
    pub fn append(&mut self, event: &NewOutboxEvent) -> OutboxResult<AppendedEvent> {
        let appended = queries::insert_outbox_event(self.conn, event, self.now)?;
        self.appended.push(appended.clone());
        Ok(appended)
    }

    /// Events appended so far in this scope.
    pub fn appended(&self) -> &[AppendedEvent] {
        &self.appended
    }
}
