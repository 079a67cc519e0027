//! Drive: the orchestration layer over the path tree, the ledger and the
//! blob store.
//!
//! Tree and ledger mutations for one request share a single immediate
//! transaction. Blob bytes live outside the database, so they are written
//! before the transaction that references them and erased only after the
//! transaction that dropped the last reference has committed.
//!
//! `blob_gate` orders those two filesystem steps against each other. Writers
//! that may add a reference to a blob hold it shared from the blob write
//! until their commit; reclaim and the orphan sweep hold it exclusively and
//! re-check the ledger before erasing anything. The gate is per process.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use nimbus_cas::{fingerprint_file, BlobStore, CasError, Fingerprint};
use nimbus_config::{log_drive_debug, log_drive_error, log_drive_info, log_drive_warn};
use nimbus_config::{Config, ConflictPolicy};
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::ledger::{ReferenceLedger, SqliteLedger};
use crate::node::{AccountId, ChildCounts, Node};
use crate::path;
use crate::tree::PathTree;
use crate::{Database, Result, VfsError};

/// Static drive settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveOptions {
    /// Per-account ceiling in bytes
    pub quota: u64,
    /// Used when a caller passes no policy
    pub conflict: ConflictPolicy,
    /// Listing pages are clamped to this many entries
    pub max_list_limit: usize,
}

impl DriveOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            quota: config.quota.bytes,
            conflict: config.drive.conflict,
            max_list_limit: config.drive.max_list_limit,
        }
    }
}

impl Default for DriveOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub used: u64,
    pub total: u64,
    pub over_quota: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    /// Nodes removed from the tree
    pub nodes_removed: usize,
    /// Blobs erased because their last reference went away
    pub blobs_reclaimed: usize,
}

/// Outcome of an orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub blobs_scanned: u64,
    pub orphans: Vec<String>,
    pub orphan_bytes: u64,
    /// False for a dry run
    pub deleted: bool,
}

pub struct Drive<L: ReferenceLedger = SqliteLedger> {
    db: Database,
    blobs: BlobStore,
    ledger: L,
    options: DriveOptions,
    blob_gate: RwLock<()>,
    known_roots: RwLock<HashSet<AccountId>>,
}

impl Drive<SqliteLedger> {
    /// Open the database and blob store named by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let db = Database::open(
            config.storage.db_path(),
            Duration::from_millis(config.storage.busy_timeout_ms),
        )?;
        let blobs = BlobStore::new(config.storage.blob_root())?;
        let db_path = db.path().display().to_string();
        let blob_root = blobs.root().display().to_string();
        log_drive_info!(
            "drive opened",
            db = db_path.as_str(),
            blobs = blob_root.as_str()
        );
        Ok(Self::with_ledger(
            db,
            blobs,
            SqliteLedger,
            DriveOptions::from_config(config),
        ))
    }
}

impl<L: ReferenceLedger> Drive<L> {
    pub fn with_ledger(db: Database, blobs: BlobStore, ledger: L, options: DriveOptions) -> Self {
        Self {
            db,
            blobs,
            ledger,
            options,
            blob_gate: RwLock::new(()),
            known_roots: RwLock::new(HashSet::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn options(&self) -> &DriveOptions {
        &self.options
    }

    // ---- reads ----

    pub fn get(&self, account: AccountId, path: &str) -> Result<Option<Node>> {
        self.ensure_root(account)?;
        let conn = self.db.lock();
        logged("get", PathTree::new(&conn, account).get(path))
    }

    pub fn exists(&self, account: AccountId, path: &str) -> Result<bool> {
        self.ensure_root(account)?;
        let conn = self.db.lock();
        logged("exists", PathTree::new(&conn, account).exists(path))
    }

    /// One page of a folder listing; `limit` is clamped to `max_list_limit`.
    pub fn list_children(
        &self,
        account: AccountId,
        path: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Node>> {
        self.ensure_root(account)?;
        let limit = limit.min(self.options.max_list_limit);
        logged(
            "list_children",
            self.db.with_read_tx(|tx| {
                PathTree::new(tx, account).list_children(path, offset, limit)
            }),
        )
    }

    pub fn count_children(&self, account: AccountId, path: &str) -> Result<ChildCounts> {
        self.ensure_root(account)?;
        let conn = self.db.lock();
        logged(
            "count_children",
            PathTree::new(&conn, account).count_children(path),
        )
    }

    pub fn space(&self, account: AccountId) -> Result<SpaceInfo> {
        let used = logged(
            "space",
            self.db
                .with_read_tx(|tx| PathTree::new(tx, account).total_size()),
        )?;
        Ok(SpaceInfo {
            used,
            total: self.options.quota,
            over_quota: used > self.options.quota,
        })
    }

    /// The file node at `path` with its content opened for reading.
    pub fn open_file(&self, account: AccountId, path: &str) -> Result<(Node, File)> {
        let node = self
            .get(account, path)?
            .ok_or_else(|| VfsError::NotFound(path::normalize(path)))?;
        let fingerprint = match (&node.fingerprint, node.is_file()) {
            (Some(fp), true) => fp.clone(),
            _ => return Err(VfsError::NotAFile(node.path)),
        };
        let file = match self.blobs.open(fingerprint.as_str()) {
            Ok(file) => file,
            Err(CasError::NotFound { .. }) => {
                log_drive_warn!(
                    "blob missing for referenced content",
                    path = node.path.as_str(),
                    fingerprint = fingerprint.as_str()
                );
                return Err(VfsError::ContentNotFound(fingerprint));
            }
            Err(e) => return logged("open_file", Err(e.into())),
        };
        Ok((node, file))
    }

    // ---- writes ----

    pub fn create_folder(&self, account: AccountId, path: &str) -> Result<Node> {
        self.ensure_root(account)?;
        logged(
            "create_folder",
            self.db
                .with_immediate_tx(|tx| PathTree::new(tx, account).create_folder(path)),
        )
    }

    /// Reference content that is already stored, by fingerprint.
    ///
    /// Fails with [`VfsError::ContentNotFound`] when neither the ledger nor
    /// the blob store knows `fingerprint`; the client must upload instead.
    pub fn add_file(
        &self,
        account: AccountId,
        path: &str,
        fingerprint: &Fingerprint,
        size: u64,
        policy: Option<ConflictPolicy>,
    ) -> Result<Node> {
        self.ensure_root(account)?;
        let policy = policy.unwrap_or(self.options.conflict);

        let gate = self.gate_shared();
        let result = self.write_tx(|tx| {
            let known = self.ledger.exists(tx, fingerprint)? || self.blobs.exists(fingerprint.as_str());
            if !known {
                return Err(VfsError::ContentNotFound(fingerprint.clone()));
            }
            self.add_in_tx(tx, account, path, fingerprint, size, policy)
        });
        drop(gate);

        let (node, released) = logged("add_file", result)?;
        self.reclaim(released)?;
        Ok(node)
    }

    /// Store `data` and create a file node referencing it.
    pub fn upload(
        &self,
        account: AccountId,
        path: &str,
        data: &[u8],
        policy: Option<ConflictPolicy>,
    ) -> Result<Node> {
        let fingerprint = Fingerprint::of(data);
        self.store_and_add(account, path, &fingerprint, data.len() as u64, data, policy)
    }

    /// Same as [`Drive::upload`], streaming from a local file.
    pub fn upload_file(
        &self,
        account: AccountId,
        path: &str,
        local: &Path,
        policy: Option<ConflictPolicy>,
    ) -> Result<Node> {
        let size = std::fs::metadata(local)?.len();
        let fingerprint = fingerprint_file(local)?;
        let reader = File::open(local)?;
        self.store_and_add(account, path, &fingerprint, size, reader, policy)
    }

    pub fn rename(&self, account: AccountId, path: &str, new_name: &str) -> Result<Node> {
        self.ensure_root(account)?;
        logged(
            "rename",
            self.db
                .with_immediate_tx(|tx| PathTree::new(tx, account).rename(path, new_name)),
        )
    }

    pub fn move_to(&self, account: AccountId, path: &str, target_folder: &str) -> Result<Node> {
        self.ensure_root(account)?;
        logged(
            "move",
            self.db
                .with_immediate_tx(|tx| PathTree::new(tx, account).move_to(path, target_folder)),
        )
    }

    /// Copy a node (recursively for folders) into `target_folder`.
    ///
    /// Every copied file adds one ledger reference; no bytes are duplicated.
    pub fn copy_to(&self, account: AccountId, path: &str, target_folder: &str) -> Result<Node> {
        self.ensure_root(account)?;
        let result = self.write_tx(|tx| {
            let tree = PathTree::new(tx, account);
            let used = tree.total_size()?;
            let outcome = tree.copy_to(path, target_folder)?;

            let mut requested = 0u64;
            for (fingerprint, size) in &outcome.files {
                self.ledger.insert_or_increment(tx, fingerprint, *size)?;
                requested = requested.saturating_add(*size);
            }
            self.check_quota(used, requested)?;

            log_drive_debug!(
                "copied",
                account = account,
                to = outcome.root.path.as_str(),
                files = outcome.files.len(),
                bytes = requested
            );
            Ok(outcome.root)
        });
        logged("copy", result)
    }

    /// Remove a node and its subtree, erasing blobs that lost their last
    /// reference. A missing path is a no-op.
    pub fn delete(&self, account: AccountId, path: &str) -> Result<DeleteReport> {
        self.ensure_root(account)?;
        let result = self.write_tx(|tx| {
            let tree = PathTree::new(tx, account);
            let released = self.release_subtree(tx, &tree, path)?;
            let removed = tree.delete(path)?;
            Ok((removed, released))
        });
        let (nodes_removed, released) = logged("delete", result)?;

        let blobs_reclaimed = self.reclaim(released)?;
        if nodes_removed > 0 {
            log_drive_info!(
                "deleted",
                account = account,
                path = path,
                nodes = nodes_removed,
                blobs = blobs_reclaimed
            );
        }
        Ok(DeleteReport {
            nodes_removed,
            blobs_reclaimed,
        })
    }

    // ---- maintenance ----

    /// Find blobs no ledger row refers to, erasing them unless `dry_run`.
    pub fn sweep_orphans(&self, dry_run: bool) -> Result<SweepReport> {
        let _gate = self.gate_exclusive();
        let conn = self.db.lock();
        let mut report = SweepReport {
            deleted: !dry_run,
            ..SweepReport::default()
        };

        for key in self.blobs.iter() {
            let key = logged("sweep", key.map_err(VfsError::from))?;
            report.blobs_scanned += 1;

            let fingerprint = match key.parse::<Fingerprint>() {
                Ok(fp) => fp,
                Err(_) => {
                    log_drive_warn!("skipping foreign file in blob store", key = key.as_str());
                    continue;
                }
            };
            if self.ledger.exists(&conn, &fingerprint)? {
                continue;
            }

            let size = self.blobs.size(&key)?.unwrap_or(0);
            if !dry_run {
                logged("sweep", self.blobs.delete(&key).map_err(VfsError::from))?;
            }
            report.orphan_bytes += size;
            report.orphans.push(key);
        }

        log_drive_info!(
            "orphan sweep finished",
            scanned = report.blobs_scanned,
            orphans = report.orphans.len(),
            bytes = report.orphan_bytes,
            dry_run = dry_run
        );
        Ok(report)
    }

    // ---- internals ----

    /// Write the blob unless present, then run the add transaction. Both
    /// steps happen under the shared gate.
    fn store_and_add<R: Read>(
        &self,
        account: AccountId,
        path: &str,
        fingerprint: &Fingerprint,
        size: u64,
        reader: R,
        policy: Option<ConflictPolicy>,
    ) -> Result<Node> {
        self.ensure_root(account)?;
        let policy = policy.unwrap_or(self.options.conflict);

        let gate = self.gate_shared();
        let stored = logged(
            "upload",
            self.blobs.size(fingerprint.as_str()).map_err(VfsError::from),
        )?;
        let wrote_blob = match stored {
            Some(stored) if stored == size => false,
            // Short content is its own zero-padded fingerprint, so payloads
            // differing only in trailing zero bytes share a key.
            Some(stored) => {
                return Err(VfsError::ContentCollision {
                    fingerprint: fingerprint.clone(),
                    stored,
                    size,
                });
            }
            None => {
                let written = logged(
                    "upload",
                    self.blobs
                        .put(fingerprint.as_str(), reader)
                        .map_err(VfsError::from),
                )?;
                if written != size {
                    // The source changed after it was fingerprinted.
                    drop(gate);
                    self.reclaim(vec![fingerprint.clone()])?;
                    return logged(
                        "upload",
                        Err(CasError::SizeMismatch {
                            declared: size,
                            actual: written,
                        }
                        .into()),
                    );
                }
                true
            }
        };
        let result =
            self.write_tx(|tx| self.add_in_tx(tx, account, path, fingerprint, size, policy));
        drop(gate);

        match logged("upload", result) {
            Ok((node, released)) => {
                self.reclaim(released)?;
                log_drive_debug!(
                    "uploaded",
                    account = account,
                    path = node.path.as_str(),
                    fingerprint = fingerprint.as_str(),
                    size = size,
                    new_blob = wrote_blob
                );
                Ok(node)
            }
            Err(e) => {
                // A blob written for a rejected add has no reference.
                if wrote_blob {
                    self.reclaim(vec![fingerprint.clone()])?;
                }
                Err(e)
            }
        }
    }

    /// Conflict handling, ledger reference, quota check, node insert.
    ///
    /// Returns the new node and fingerprints whose last reference was
    /// dropped by a replace.
    fn add_in_tx(
        &self,
        tx: &Connection,
        account: AccountId,
        path: &str,
        fingerprint: &Fingerprint,
        size: u64,
        policy: ConflictPolicy,
    ) -> Result<(Node, Vec<Fingerprint>)> {
        let tree = PathTree::new(tx, account);
        let path = path::normalize(path);
        let mut released = Vec::new();

        let target = match tree.get(&path)? {
            None => path,
            Some(existing) => match policy {
                ConflictPolicy::Strict => return Err(VfsError::AlreadyExists(path)),
                ConflictPolicy::Rename => tree.free_path(&path)?,
                ConflictPolicy::Replace => {
                    if existing.is_folder() {
                        return Err(VfsError::AlreadyExists(path));
                    }
                    released = self.release_subtree(tx, &tree, &path)?;
                    tree.delete(&path)?;
                    path
                }
            },
        };

        self.ledger.insert_or_increment(tx, fingerprint, size)?;
        self.check_quota(tree.total_size()?, size)?;
        let node = tree.create_file(&target, fingerprint, size)?;
        Ok((node, released))
    }

    /// Drop the ledger reference of every file under `path`.
    fn release_subtree(
        &self,
        tx: &Connection,
        tree: &PathTree<'_>,
        path: &str,
    ) -> Result<Vec<Fingerprint>> {
        let mut released = Vec::new();
        for (fingerprint, _) in tree.subtree_files(path)? {
            if self.ledger.decrement(tx, &fingerprint)? {
                released.push(fingerprint);
            }
        }
        Ok(released)
    }

    /// Immediate transaction whose ledger updates share its outcome.
    fn write_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        self.ledger.begin();
        let result = self.db.with_immediate_tx(f);
        match &result {
            Ok(_) => self.ledger.commit(),
            Err(_) => self.ledger.rollback(),
        }
        result
    }

    fn check_quota(&self, used: u64, requested: u64) -> Result<()> {
        let quota = self.options.quota;
        if used.saturating_add(requested) > quota {
            return Err(VfsError::QuotaExceeded {
                used,
                requested,
                quota,
            });
        }
        Ok(())
    }

    /// Erase blobs whose ledger row is gone. Runs after the commit that
    /// dropped the reference; a blob re-referenced since then is kept.
    fn reclaim(&self, candidates: Vec<Fingerprint>) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let _gate = self.gate_exclusive();
        let conn = self.db.lock();

        let mut erased = 0;
        let mut first_error = None;
        for fingerprint in candidates {
            if self.ledger.exists(&conn, &fingerprint)? {
                continue;
            }
            match self.blobs.delete(fingerprint.as_str()) {
                Ok(()) => erased += 1,
                Err(e) => {
                    let message = e.to_string();
                    log_drive_error!(
                        "blob reclaim failed",
                        fingerprint = fingerprint.as_str(),
                        error = message.as_str()
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(erased),
        }
    }

    fn ensure_root(&self, account: AccountId) -> Result<()> {
        let known = self
            .known_roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&account);
        if known {
            return Ok(());
        }
        logged(
            "ensure_root",
            self.db
                .with_immediate_tx(|tx| PathTree::new(tx, account).ensure_root()),
        )?;
        self.known_roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account);
        Ok(())
    }

    fn gate_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.blob_gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.blob_gate.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Log storage faults before they propagate.
fn logged<T>(op: &'static str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if e.kind() == ErrorKind::Storage {
            let message = e.to_string();
            log_drive_error!("storage failure", op = op, error = message.as_str());
        }
    }
    result
}
