//! SQLite connection management and schema bootstrap.
//!
//! All four tables (`events`, `snapshots`, `projections`, `command_log`)
//! are created idempotently from the embedded `schema.sql` when a database
//! is opened. File-backed stores run in WAL mode so readers proceed in
//! parallel with the single writer; the path `":memory:"` selects a
//! volatile in-memory database instead.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags};

use crate::error::Result;

/// Schema DDL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Path literal designating a volatile in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// Shared handle to the underlying SQLite connection.
///
/// Cheap to clone: clones share one connection behind a mutex, which is
/// also what serializes all store mutations -- a single writer at a time,
/// readers observing a committed state. Connections opened with `NO_MUTEX`
/// rely on this lock instead of SQLite's own.
#[derive(Debug, Clone)]
pub(crate) struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `db_path` and apply the schema.
    ///
    /// The literal `":memory:"` opens a volatile in-memory database; any
    /// other string is treated as a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`](crate::StoreError::Unavailable)
    /// if the database cannot be opened or the schema cannot be applied.
    pub(crate) fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path == MEMORY_PATH {
            Connection::open_in_memory()?
        } else {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        };
        // schema.sql includes the PRAGMA statements.
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock and return the connection guard.
    ///
    /// Mutex poisoning means another thread panicked mid-operation; the
    /// connection state is unknown at that point, so propagating the panic
    /// is the only sound option.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database connection mutex poisoned")
    }
}
