//! Reference ledger: how many nodes point at each fingerprint.
//!
//! The ledger only does bookkeeping. It never touches the blob store; the
//! caller deletes a blob after `decrement` reports the count reached zero.
//!
//! Methods take the connection (usually a transaction) to run against, so a
//! ledger update commits or rolls back together with the node mutation that
//! caused it. Ledgers keeping state outside the database follow the same
//! outcome through [`ReferenceLedger::begin`], `commit` and `rollback`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use nimbus_cas::Fingerprint;
use nimbus_config::log_ledger_debug;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::Result;

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub ref_count: u64,
}

pub trait ReferenceLedger: Send + Sync {
    /// Add one reference, creating the row on first use.
    ///
    /// Returns `true` if the row was created by this call.
    fn insert_or_increment(
        &self,
        conn: &Connection,
        fingerprint: &Fingerprint,
        size: u64,
    ) -> Result<bool>;

    /// Drop one reference.
    ///
    /// Returns `true` if the count reached zero and the row was removed.
    /// A missing row is a no-op returning `false`.
    fn decrement(&self, conn: &Connection, fingerprint: &Fingerprint) -> Result<bool>;

    fn exists(&self, conn: &Connection, fingerprint: &Fingerprint) -> Result<bool>;

    fn get(&self, conn: &Connection, fingerprint: &Fingerprint) -> Result<Option<ContentEntry>>;

    /// A transaction carrying ledger updates is about to start on this thread.
    fn begin(&self) {}

    /// The transaction started by `begin` committed.
    fn commit(&self) {}

    /// The transaction started by `begin` rolled back; its updates must
    /// disappear with it.
    fn rollback(&self) {}
}

/// Ledger backed by the `contents` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteLedger;

impl ReferenceLedger for SqliteLedger {
    fn insert_or_increment(
        &self,
        conn: &Connection,
        fingerprint: &Fingerprint,
        size: u64,
    ) -> Result<bool> {
        // Rows are deleted at zero, so a count of 1 after the upsert means
        // the row did not exist before.
        let count: i64 = conn.query_row(
            "INSERT INTO contents (fingerprint, size, ref_count) VALUES (?1, ?2, 1)
             ON CONFLICT(fingerprint) DO UPDATE SET ref_count = ref_count + 1
             RETURNING ref_count",
            params![fingerprint.as_str(), size as i64],
            |row| row.get(0),
        )?;
        log_ledger_debug!(
            "reference added",
            fingerprint = fingerprint.as_str(),
            ref_count = count
        );
        Ok(count == 1)
    }

    fn decrement(&self, conn: &Connection, fingerprint: &Fingerprint) -> Result<bool> {
        let remaining: Option<i64> = conn
            .query_row(
                "UPDATE contents SET ref_count = MAX(ref_count - 1, 0)
                 WHERE fingerprint = ?1
                 RETURNING ref_count",
                params![fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match remaining {
            None => Ok(false),
            Some(n) if n <= 0 => {
                conn.execute(
                    "DELETE FROM contents WHERE fingerprint = ?1 AND ref_count <= 0",
                    params![fingerprint.as_str()],
                )?;
                log_ledger_debug!("last reference dropped", fingerprint = fingerprint.as_str());
                Ok(true)
            }
            Some(n) => {
                log_ledger_debug!(
                    "reference dropped",
                    fingerprint = fingerprint.as_str(),
                    ref_count = n
                );
                Ok(false)
            }
        }
    }

    fn exists(&self, conn: &Connection, fingerprint: &Fingerprint) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM contents WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get(&self, conn: &Connection, fingerprint: &Fingerprint) -> Result<Option<ContentEntry>> {
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT size, ref_count FROM contents WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(size, ref_count)| ContentEntry {
            fingerprint: fingerprint.clone(),
            size: size.max(0) as u64,
            ref_count: ref_count.max(0) as u64,
        }))
    }
}

/// Inverse of one update applied inside an open transaction.
#[derive(Debug)]
enum Undo {
    Increment(Fingerprint),
    Decrement(ContentEntry),
}

/// In-memory ledger for tests.
///
/// Updates apply immediately. Between `begin` and `commit` each thread keeps
/// an undo journal that `rollback` replays, so a rejected request leaves no
/// reference behind, as with [`SqliteLedger`].
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<Fingerprint, ContentEntry>>,
    journals: Mutex<HashMap<ThreadId, Vec<Undo>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, ContentEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn journals(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<Undo>>> {
        self.journals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Journal `undo` if this thread has an open transaction.
    fn record(&self, undo: Undo) {
        if let Some(journal) = self.journals().get_mut(&thread::current().id()) {
            journal.push(undo);
        }
    }
}

fn add_ref(entries: &mut HashMap<Fingerprint, ContentEntry>, entry: ContentEntry) -> bool {
    match entries.get_mut(&entry.fingerprint) {
        Some(existing) => {
            existing.ref_count += 1;
            false
        }
        None => {
            entries.insert(
                entry.fingerprint.clone(),
                ContentEntry {
                    ref_count: 1,
                    ..entry
                },
            );
            true
        }
    }
}

/// Returns the entry as it was before, or `None` if there was no row.
fn drop_ref(
    entries: &mut HashMap<Fingerprint, ContentEntry>,
    fingerprint: &Fingerprint,
) -> Option<ContentEntry> {
    let entry = entries.get_mut(fingerprint)?;
    let before = entry.clone();
    entry.ref_count = entry.ref_count.saturating_sub(1);
    if entry.ref_count == 0 {
        entries.remove(fingerprint);
    }
    Some(before)
}

impl ReferenceLedger for MemoryLedger {
    fn insert_or_increment(
        &self,
        _conn: &Connection,
        fingerprint: &Fingerprint,
        size: u64,
    ) -> Result<bool> {
        let created = add_ref(
            &mut self.lock(),
            ContentEntry {
                fingerprint: fingerprint.clone(),
                size,
                ref_count: 1,
            },
        );
        self.record(Undo::Increment(fingerprint.clone()));
        Ok(created)
    }

    fn decrement(&self, _conn: &Connection, fingerprint: &Fingerprint) -> Result<bool> {
        let mut entries = self.lock();
        let Some(before) = drop_ref(&mut entries, fingerprint) else {
            return Ok(false);
        };
        let reached_zero = !entries.contains_key(fingerprint);
        drop(entries);
        self.record(Undo::Decrement(before));
        Ok(reached_zero)
    }

    fn exists(&self, _conn: &Connection, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.lock().contains_key(fingerprint))
    }

    fn get(&self, _conn: &Connection, fingerprint: &Fingerprint) -> Result<Option<ContentEntry>> {
        Ok(self.lock().get(fingerprint).cloned())
    }

    fn begin(&self) {
        self.journals().insert(thread::current().id(), Vec::new());
    }

    fn commit(&self) {
        self.journals().remove(&thread::current().id());
    }

    fn rollback(&self) {
        let Some(journal) = self.journals().remove(&thread::current().id()) else {
            return;
        };
        let mut entries = self.lock();
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Increment(fingerprint) => {
                    drop_ref(&mut entries, &fingerprint);
                }
                Undo::Decrement(entry) => {
                    add_ref(&mut entries, entry);
                }
            }
        }
        log_ledger_debug!("in-memory updates rolled back");
    }
}
