//! Async SQLite executor using a dedicated background thread.
//!
//! Every `AsyncDatabase` owns one connection served by one thread. Queries are
//! sent through a channel and run in FIFO order; callers await the result
//! without blocking the Tokio runtime.
//!
//! Several relay processes (or several `AsyncDatabase` handles in one process)
//! can open the same file. WAL mode plus `busy_timeout` lets them coexist, and
//! `transaction()` takes the write lock up front (`BEGIN IMMEDIATE`) so claim
//! transactions from different handles serialize instead of deadlocking.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//!
//! // Business write and outbox append commit together.
//! db.transaction(|tx| {
//!     tx.execute("UPDATE orders SET price = 12 WHERE id = 42", [])?;
//!     queries::insert_outbox_event(tx, &event, Utc::now())?;
//!     Ok::<_, DatabaseError>(())
//! })
//! .await?;
//! ```

use crate::{migrations, DatabaseError, DatabaseResult};
use rusqlite::TransactionBehavior;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// Convert a tokio_rusqlite::Error to DatabaseError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::ConnectionClosed => {
            DatabaseError::Connection("Connection closed".to_string())
        }
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// Async SQLite database with a dedicated executor thread.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open a database at the given path.
    ///
    /// Creates the file and its parent directory if needed, enables WAL mode
    /// and runs pending migrations.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening outbox database");

        let conn = Connection::open(path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            conn,
            path: path_str,
        };
        db.initialize().await?;

        info!(path = %db.path, "Outbox database initialized with WAL mode");
        Ok(db)
    }

    /// Open a private in-memory database (tests, dry runs).
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            conn,
            path: ":memory:".to_string(),
        };
        db.initialize().await?;
        Ok(db)
    }

    async fn initialize(&self) -> DatabaseResult<()> {
        self.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA cache_size = -64000;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            migrations::run_migrations(conn)
        })
        .await
    }

    /// Execute a closure on the database connection.
    ///
    /// The closure runs on the dedicated SQLite thread. Only SQL and light row
    /// mapping belong inside it; network calls and heavy computation would
    /// stall every other query on this handle.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // The inner DatabaseResult rides inside tokio_rusqlite's Ok variant.
        let outer_result = self.conn.call(move |conn| Ok(f(conn))).await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back when it returns `Err` (the
    /// transaction is dropped uncommitted). The error type is the caller's, so
    /// business code can mix its own failures with database ones.
    pub async fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DatabaseError> + Send + 'static,
    {
        let outer_result = self
            .conn
            .call(move |conn| {
                let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
                    Ok(tx) => tx,
                    Err(e) => return Ok(Err(E::from(DatabaseError::Sqlite(e)))),
                };

                let value = match f(&tx) {
                    Ok(value) => value,
                    Err(e) => {
                        if let Err(rollback) = tx.rollback() {
                            debug!(error = %rollback, "Rollback after failed transaction body");
                        }
                        return Ok(Err(e));
                    }
                };

                match tx.commit() {
                    Ok(()) => Ok(Ok(value)),
                    Err(e) => Ok(Err(E::from(DatabaseError::Sqlite(e)))),
                }
            })
            .await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(E::from(from_tokio_rusqlite(e))),
        }
    }

    /// Get the database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the database is healthy by executing a simple query.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(())
        })
        .await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Close the database connection after pending operations finish.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {:?}", e)))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}
