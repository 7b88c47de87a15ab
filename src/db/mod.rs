//! SQLite store for projects, resource trees, subscriptions and members
//!
//! One `TrackerDb` is opened at startup and shared as `Arc<TrackerDb>` by
//! every component. All shards point at the same database file; isolation
//! between concurrent writers comes from SQLite transactions only.
//!
//! ## Tables
//!
//! - `projects` - name, thread handle, optional deadline
//! - `resources` - per-project forest of resource nodes
//! - `subscriptions` - (user, project, resource?) triples
//! - `project_members` - (user, project) pairs granting write access

pub mod schema;
pub mod projects;
pub mod resources;
pub mod subscriptions;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::TrackerError;

/// SQL function lowercasing text with Unicode rules; SQLite's NOCASE and
/// LIKE only fold ASCII
pub const FOLD_FUNCTION: &str = "qm_fold";

/// Case-folded form of a name, as stored comparisons see it
pub fn fold(name: &str) -> String {
    name.trim().to_lowercase()
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        FOLD_FUNCTION,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|t| fold(&t)))
        },
    )
}

/// Shared handle to the tracker database
///
/// `close` works through a shared reference; any use after it returns an
/// `Internal` error.
pub struct TrackerDb {
    conn: Mutex<Option<Connection>>,
}

impl TrackerDb {
    /// Open or create the database file at `path`
    pub fn open(path: &Path) -> Result<Self, TrackerError> {
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path)
            .map_err(|e| TrackerError::Internal(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| TrackerError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, TrackerError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| TrackerError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, TrackerError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| TrackerError::Internal(format!("Failed to enable foreign keys: {}", e)))?;

        register_functions(&conn)
            .map_err(|e| TrackerError::Internal(format!("Failed to register SQL functions: {}", e)))?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Run a read-only closure against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, TrackerError>
    where
        F: FnOnce(&Connection) -> Result<T, TrackerError>,
    {
        let guard = self.conn.lock()
            .map_err(|e| TrackerError::Internal(format!("Lock poisoned: {}", e)))?;
        let conn = guard.as_ref().ok_or_else(closed)?;
        f(conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, TrackerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, TrackerError>,
    {
        let mut guard = self.conn.lock()
            .map_err(|e| TrackerError::Internal(format!("Lock poisoned: {}", e)))?;
        let conn = guard.as_mut().ok_or_else(closed)?;
        f(conn)
    }

    /// Close the connection, flushing the WAL; closing twice is a no-op
    pub fn close(&self) -> Result<(), TrackerError> {
        let mut guard = self.conn.lock()
            .map_err(|e| TrackerError::Internal(format!("Lock poisoned: {}", e)))?;
        let Some(conn) = guard.take() else {
            return Ok(());
        };
        if let Err((conn, e)) = conn.close() {
            *guard = Some(conn);
            return Err(TrackerError::Database(e));
        }
        info!("SQLite database closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }

    /// Row counts across the store
    pub fn stats(&self) -> Result<DbStats, TrackerError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, TrackerError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                project_count: count("SELECT COUNT(*) FROM projects")?,
                resource_count: count("SELECT COUNT(*) FROM resources")?,
                subscription_count: count("SELECT COUNT(*) FROM subscriptions")?,
                member_count: count("SELECT COUNT(*) FROM project_members")?,
            })
        })
    }
}

fn closed() -> TrackerError {
    TrackerError::Internal("database is closed".into())
}

/// Begin a write transaction holding the database write lock from the start
///
/// Other processes sharing the file wait on `busy_timeout` instead of
/// reading a row this transaction is about to rewrite.
pub fn write_tx(conn: &mut Connection) -> Result<Transaction<'_>, TrackerError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| TrackerError::Internal(format!("Failed to start transaction: {}", e)))
}

pub fn commit(tx: Transaction<'_>) -> Result<(), TrackerError> {
    tx.commit()
        .map_err(|e| TrackerError::Internal(format!("Failed to commit transaction: {}", e)))
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub project_count: u64,
    pub resource_count: u64,
    pub subscription_count: u64,
    pub member_count: u64,
}

/// Current time as unix seconds
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = TrackerDb::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.project_count, 0);
        assert_eq!(stats.resource_count, 0);
    }

    #[test]
    fn test_open_file_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tracker.db");

        let db = TrackerDb::open(&path).unwrap();
        db.with_conn_mut(|conn| projects::create_project(conn, "Keep", None)).unwrap();
        db.close().unwrap();

        let db = TrackerDb::open(&path).unwrap();
        assert_eq!(db.stats().unwrap().project_count, 1);
    }

    #[test]
    fn test_close_through_shared_handle() {
        let db = std::sync::Arc::new(TrackerDb::open_in_memory().unwrap());
        let other = db.clone();

        db.close().unwrap();
        assert!(other.is_closed());
        assert!(matches!(other.stats(), Err(TrackerError::Internal(_))));
        // Second close is harmless
        other.close().unwrap();
    }

    #[test]
    fn test_fold_function_is_unicode_aware() {
        let db = TrackerDb::open_in_memory().unwrap();
        let folded: String = db
            .with_conn(|conn| Ok(conn.query_row("SELECT qm_fold('ÉCLAT Ärger')", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(folded, "éclat ärger");
        assert_eq!(fold("  Éclat "), "éclat");
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let db = TrackerDb::open_in_memory().unwrap();
        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO resources (project_id, resource, amount) VALUES (999, 'Orphan', 1)",
                [],
            )?;
            Ok(())
        });
        assert!(matches!(result, Err(TrackerError::Database(_))));
    }
}
