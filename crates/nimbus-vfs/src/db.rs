//! SQLite persistence for the node tree and the reference ledger.
//!
//! Each [`Database`] owns one connection in WAL mode with foreign keys
//! enabled; clones share it behind a mutex. Multi-statement mutations run
//! inside `BEGIN IMMEDIATE` so the write lock is taken before the first read.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::Result;

const SCHEMA: &str = r#"
-- Per-account path hierarchy
CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY,
    account INTEGER NOT NULL,
    parent_id INTEGER REFERENCES nodes(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('file', 'folder')),
    size INTEGER NOT NULL DEFAULT 0 CHECK (size >= 0),
    fingerprint TEXT,
    modified_at INTEGER NOT NULL,
    rev INTEGER NOT NULL DEFAULT 1,
    grev INTEGER NOT NULL DEFAULT 1,
    UNIQUE (account, path)
);
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_nodes_fingerprint ON nodes(fingerprint);

-- Reference ledger, global across accounts
CREATE TABLE IF NOT EXISTS contents (
    fingerprint TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    ref_count INTEGER NOT NULL CHECK (ref_count >= 0)
);
"#;

/// Handle to the Nimbus database file.
#[derive(Clone)]
pub struct Database {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open or create the database at `path` and ensure the schema exists.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        // Other processes (the CLI, a server) may hold the write lock.
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exclusive access to the connection until the guard drops.
    ///
    /// A panic inside a transaction rolls it back while unwinding, so a
    /// poisoned lock still guards a usable connection.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` inside an immediate transaction. Any error rolls back.
    pub fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run `f` inside a read transaction for a consistent snapshot.
    pub fn with_read_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
