//! Per-account path tree over the `nodes` table.
//!
//! A [`PathTree`] is a thin view binding a connection (normally an open
//! transaction) to one account. It maintains the tree invariants:
//!
//! - exactly one node per `(account, path)`;
//! - every node's `path` is its parent's path plus `/` plus its `name`;
//! - every non-root node's parent is an existing folder.
//!
//! Rename and move rewrite all descendant paths with a single `UPDATE`
//! keyed on the old prefix, so no reader ever sees a half-moved subtree.
//! Prefixes are compared with `substr` rather than `LIKE`, which keeps `%`
//! and `_` in names literal. `substr` and `length` count characters, hence
//! the `chars().count()` below.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use nimbus_cas::Fingerprint;
use nimbus_config::log_vfs_debug;
use rusqlite::{params, Connection, OptionalExtension};

use crate::node::{AccountId, ChildCounts, Node, NodeId, NodeKind};
use crate::path::{self, ROOT};
use crate::{Result, VfsError};

/// Gives up looking for a free `name (N).ext` after this many tries.
const MAX_NUMBERED_NAMES: u32 = 10_000;

/// Result of a copy: the new top node and every file reference it created.
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub root: Node,
    pub files: Vec<(Fingerprint, u64)>,
}

pub struct PathTree<'c> {
    conn: &'c Connection,
    account: AccountId,
}

impl<'c> PathTree<'c> {
    pub fn new(conn: &'c Connection, account: AccountId) -> Self {
        Self { conn, account }
    }

    /// Create the account's root folder if it does not exist yet.
    pub fn ensure_root(&self) -> Result<()> {
        let created = self.conn.execute(
            "INSERT OR IGNORE INTO nodes
                (account, parent_id, name, path, kind, size, fingerprint, modified_at, rev, grev)
             VALUES (?1, NULL, '', '/', 'folder', 0, NULL, ?2, 1, 1)",
            params![self.account, unix_now()],
        )?;
        if created > 0 {
            log_vfs_debug!("root created", account = self.account);
        }
        Ok(())
    }

    /// Node at `path`, or `None`.
    pub fn get(&self, path: &str) -> Result<Option<Node>> {
        self.node_at(&path::normalize(path))
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM nodes WHERE account = ?1 AND path = ?2",
                params![self.account, path::normalize(path)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Direct children of a folder: folders first, then files, each by name.
    pub fn list_children(&self, path: &str, offset: usize, limit: usize) -> Result<Vec<Node>> {
        let folder = self.require_folder(&path::normalize(path))?;
        let sql = format!(
            "SELECT {} FROM nodes
             WHERE account = ?1 AND parent_id = ?2
             ORDER BY CASE kind WHEN 'folder' THEN 0 ELSE 1 END, name
             LIMIT ?3 OFFSET ?4",
            Node::COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
                self.account,
                folder.id,
                i64::try_from(limit).unwrap_or(i64::MAX),
                i64::try_from(offset).unwrap_or(i64::MAX)
            ],
            Node::from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Number of direct child folders and files.
    pub fn count_children(&self, path: &str) -> Result<ChildCounts> {
        let folder = self.require_folder(&path::normalize(path))?;
        let (folders, files): (i64, i64) = self.conn.query_row(
            "SELECT COALESCE(SUM(kind = 'folder'), 0), COALESCE(SUM(kind = 'file'), 0)
             FROM nodes WHERE account = ?1 AND parent_id = ?2",
            params![self.account, folder.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(ChildCounts {
            folders: folders.max(0) as u64,
            files: files.max(0) as u64,
        })
    }

    pub fn create_folder(&self, path: &str) -> Result<Node> {
        let path = path::normalize(path);
        let parent = self.require_parent(&path)?;
        if self.node_at(&path)?.is_some() {
            return Err(VfsError::AlreadyExists(path));
        }
        let id = self.insert_node(
            parent.id,
            path::name_of(&path),
            &path,
            NodeKind::Folder,
            0,
            None,
        )?;
        log_vfs_debug!("folder created", account = self.account, path = path.as_str());
        self.node_by_id(id)
    }

    /// Insert a file node. The caller registers the reference in the ledger.
    pub fn create_file(&self, path: &str, fingerprint: &Fingerprint, size: u64) -> Result<Node> {
        let path = path::normalize(path);
        let parent = self.require_parent(&path)?;
        if self.node_at(&path)?.is_some() {
            return Err(VfsError::AlreadyExists(path));
        }
        let id = self.insert_node(
            parent.id,
            path::name_of(&path),
            &path,
            NodeKind::File,
            size,
            Some(fingerprint),
        )?;
        log_vfs_debug!(
            "file created",
            account = self.account,
            path = path.as_str(),
            fingerprint = fingerprint.as_str(),
            size = size
        );
        self.node_by_id(id)
    }

    /// Give the node a new leaf name within the same folder.
    pub fn rename(&self, path: &str, new_name: &str) -> Result<Node> {
        let path = path::normalize(path);
        path::validate_name(new_name)?;

        let node = self
            .node_at(&path)?
            .ok_or_else(|| VfsError::NotFound(path.clone()))?;
        let parent_id = match node.parent {
            Some(id) if !node.is_root() => id,
            _ => return Err(VfsError::InvalidOperation("cannot rename the root".into())),
        };
        if node.name == new_name {
            return Ok(node);
        }

        let new_path = path::join(path::parent_of(&path).unwrap_or(ROOT), new_name);
        self.relocate(&node, parent_id, new_name, &new_path)
    }

    /// Reparent the node under `target_folder`, keeping its name.
    pub fn move_to(&self, path: &str, target_folder: &str) -> Result<Node> {
        let path = path::normalize(path);
        let target_path = path::normalize(target_folder);

        let node = self
            .node_at(&path)?
            .ok_or_else(|| VfsError::NotFound(path.clone()))?;
        if node.is_root() {
            return Err(VfsError::InvalidOperation("cannot move the root".into()));
        }
        let target = self.require_target(&target_path)?;
        if node.is_folder() && path::is_within(&target.path, &node.path) {
            return Err(VfsError::InvalidOperation(format!(
                "cannot move {} into itself",
                node.path
            )));
        }

        let new_path = path::join(&target.path, &node.name);
        if new_path == node.path {
            return Ok(node);
        }
        let name = node.name.clone();
        self.relocate(&node, target.id, &name, &new_path)
    }

    /// Duplicate the node (recursively for folders) under `target_folder`.
    ///
    /// Every copy gets a fresh id and `rev`/`grev` of 1; files keep their
    /// fingerprint. The ledger is not touched here: the returned
    /// [`CopyOutcome::files`] lists the references the caller must add.
    pub fn copy_to(&self, path: &str, target_folder: &str) -> Result<CopyOutcome> {
        let path = path::normalize(path);
        let target_path = path::normalize(target_folder);

        let source = self
            .node_at(&path)?
            .ok_or_else(|| VfsError::NotFound(path.clone()))?;
        if source.is_root() {
            return Err(VfsError::InvalidOperation("cannot copy the root".into()));
        }
        let target = self.require_target(&target_path)?;
        if source.is_folder() && path::is_within(&target.path, &source.path) {
            return Err(VfsError::InvalidOperation(format!(
                "cannot copy {} into itself",
                source.path
            )));
        }

        let dest_path = path::join(&target.path, &source.name);
        if self.node_at(&dest_path)?.is_some() {
            return Err(VfsError::AlreadyExists(dest_path));
        }

        // Shorter paths first, so every parent is copied before its children.
        let subtree = if source.is_folder() {
            self.subtree(&source.path)?
        } else {
            vec![source.clone()]
        };

        let mut id_map: HashMap<NodeId, NodeId> = HashMap::with_capacity(subtree.len());
        let mut files = Vec::new();
        for node in &subtree {
            let (parent_id, new_path) = if node.id == source.id {
                (target.id, dest_path.clone())
            } else {
                let parent = node
                    .parent
                    .and_then(|p| id_map.get(&p).copied())
                    .ok_or_else(|| {
                        VfsError::Corrupt(format!("parent of {} not copied", node.path))
                    })?;
                (
                    parent,
                    format!("{}{}", dest_path, &node.path[source.path.len()..]),
                )
            };

            let new_id = self.insert_node(
                parent_id,
                &node.name,
                &new_path,
                node.kind,
                node.size,
                node.fingerprint.as_ref(),
            )?;
            id_map.insert(node.id, new_id);

            if let Some(fp) = &node.fingerprint {
                files.push((fp.clone(), node.size));
            }
        }

        log_vfs_debug!(
            "subtree copied",
            account = self.account,
            from = source.path.as_str(),
            to = dest_path.as_str(),
            nodes = subtree.len()
        );

        let root_id = id_map
            .get(&source.id)
            .copied()
            .ok_or_else(|| VfsError::Corrupt(format!("{} not copied", source.path)))?;
        Ok(CopyOutcome {
            root: self.node_by_id(root_id)?,
            files,
        })
    }

    /// Fingerprints and sizes of every file at or below `path`.
    pub fn subtree_files(&self, path: &str) -> Result<Vec<(Fingerprint, u64)>> {
        let path = path::normalize(path);
        let prefix = path::child_prefix(&path);
        let mut stmt = self.conn.prepare_cached(
            "SELECT fingerprint, size FROM nodes
             WHERE account = ?1 AND kind = 'file' AND fingerprint IS NOT NULL
               AND (path = ?2 OR substr(path, 1, ?3) = ?4)",
        )?;
        let rows = stmt.query_map(
            params![self.account, path, prefix.chars().count() as i64, prefix],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let mut files = Vec::new();
        for row in rows {
            let (fp, size) = row?;
            files.push((fp.parse::<Fingerprint>()?, size.max(0) as u64));
        }
        Ok(files)
    }

    /// Remove the node and its whole subtree. Missing paths are a no-op.
    ///
    /// Deleting `/` clears the account but keeps the root folder.
    /// Returns the number of nodes removed.
    pub fn delete(&self, path: &str) -> Result<usize> {
        let path = path::normalize(path);
        let prefix = path::child_prefix(&path);
        let prefix_len = prefix.chars().count() as i64;
        // Cascaded child deletes are not reported by changes(), so count first.
        let removed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM nodes
             WHERE account = ?1 AND path != '/'
               AND (path = ?2 OR substr(path, 1, ?3) = ?4)",
            params![self.account, path, prefix_len, prefix],
            |row| row.get(0),
        )?;
        if removed == 0 {
            return Ok(0);
        }
        self.conn.execute(
            "DELETE FROM nodes
             WHERE account = ?1 AND path != '/'
               AND (path = ?2 OR substr(path, 1, ?3) = ?4)",
            params![self.account, path, prefix_len, prefix],
        )?;
        let removed = removed as usize;
        if removed > 0 {
            log_vfs_debug!(
                "subtree deleted",
                account = self.account,
                path = path.as_str(),
                nodes = removed
            );
        }
        Ok(removed)
    }

    /// Sum of file sizes for the account, computed on demand.
    pub fn total_size(&self) -> Result<u64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM nodes WHERE account = ?1 AND kind = 'file'",
            params![self.account],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    /// First free path among `path`, `name (1).ext`, `name (2).ext`, ...
    pub fn free_path(&self, path: &str) -> Result<String> {
        let path = path::normalize(path);
        if !self.exists(&path)? {
            return Ok(path);
        }
        let parent = path::parent_of(&path).unwrap_or(ROOT);
        let name = path::name_of(&path);
        for n in 1..=MAX_NUMBERED_NAMES {
            let candidate = path::join(parent, &path::numbered_name(name, n));
            if !self.exists(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(VfsError::AlreadyExists(path))
    }

    fn relocate(
        &self,
        node: &Node,
        parent_id: NodeId,
        new_name: &str,
        new_path: &str,
    ) -> Result<Node> {
        if self.node_at(new_path)?.is_some() {
            return Err(VfsError::AlreadyExists(new_path.to_string()));
        }

        self.conn.execute(
            "UPDATE nodes SET parent_id = ?1, name = ?2, path = ?3, modified_at = ?4
             WHERE id = ?5",
            params![parent_id, new_name, new_path, unix_now(), node.id],
        )?;

        if node.is_folder() {
            let old_prefix = path::child_prefix(&node.path);
            let new_prefix = path::child_prefix(new_path);
            let old_len = old_prefix.chars().count() as i64;
            let rewritten = self.conn.execute(
                "UPDATE nodes SET path = ?1 || substr(path, ?2)
                 WHERE account = ?3 AND substr(path, 1, ?4) = ?5",
                params![new_prefix, old_len + 1, self.account, old_len, old_prefix],
            )?;
            log_vfs_debug!(
                "descendants rewritten",
                account = self.account,
                from = node.path.as_str(),
                to = new_path,
                nodes = rewritten
            );
        }

        self.node_by_id(node.id)
    }

    fn insert_node(
        &self,
        parent_id: NodeId,
        name: &str,
        path: &str,
        kind: NodeKind,
        size: u64,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<NodeId> {
        self.conn.execute(
            "INSERT INTO nodes
                (account, parent_id, name, path, kind, size, fingerprint, modified_at, rev, grev)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 1)",
            params![
                self.account,
                parent_id,
                name,
                path,
                kind.as_str(),
                size as i64,
                fingerprint.map(Fingerprint::as_str),
                unix_now()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn node_at(&self, normalized: &str) -> Result<Option<Node>> {
        let sql = format!(
            "SELECT {} FROM nodes WHERE account = ?1 AND path = ?2",
            Node::COLUMNS
        );
        let node = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![self.account, normalized], Node::from_row)
            .optional()?;
        Ok(node)
    }

    fn node_by_id(&self, id: NodeId) -> Result<Node> {
        let sql = format!("SELECT {} FROM nodes WHERE id = ?1", Node::COLUMNS);
        let node = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![id], Node::from_row)
            .optional()?;
        node.ok_or_else(|| VfsError::Corrupt(format!("node {} vanished", id)))
    }

    /// The node at `path` and all its descendants, parents before children.
    fn subtree(&self, path: &str) -> Result<Vec<Node>> {
        let prefix = path::child_prefix(path);
        let sql = format!(
            "SELECT {} FROM nodes
             WHERE account = ?1 AND (path = ?2 OR substr(path, 1, ?3) = ?4)
             ORDER BY length(path), path",
            Node::COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![self.account, path, prefix.chars().count() as i64, prefix],
            Node::from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn require_folder(&self, path: &str) -> Result<Node> {
        let node = self
            .node_at(path)?
            .ok_or_else(|| VfsError::NotFound(path.to_string()))?;
        if !node.is_folder() {
            return Err(VfsError::NotAFolder(path.to_string()));
        }
        Ok(node)
    }

    fn require_target(&self, path: &str) -> Result<Node> {
        let node = self
            .node_at(path)?
            .ok_or_else(|| VfsError::TargetMissing(path.to_string()))?;
        if !node.is_folder() {
            return Err(VfsError::NotAFolder(path.to_string()));
        }
        Ok(node)
    }

    fn require_parent(&self, path: &str) -> Result<Node> {
        let name = path::name_of(path);
        path::validate_name(name)?;
        let parent_path = path::parent_of(path).unwrap_or(ROOT);
        match self.node_at(parent_path)? {
            Some(parent) if parent.is_folder() => Ok(parent),
            Some(_) => Err(VfsError::NotAFolder(parent_path.to_string())),
            None => Err(VfsError::ParentMissing(path.to_string())),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use std::time::Duration;
    use tempfile::TempDir;

    const ACCOUNT: AccountId = 7;

    fn setup() -> (TempDir, Database) {
        let temp = TempDir::new().unwrap();
        let db = Database::open(temp.path().join("nimbus.db"), Duration::from_secs(5)).unwrap();
        db.with_immediate_tx(|tx| PathTree::new(tx, ACCOUNT).ensure_root())
            .unwrap();
        (temp, db)
    }

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::of(&[byte; 100])
    }

    fn paths(tree: &PathTree<'_>, folder: &str) -> Vec<String> {
        tree.list_children(folder, 0, usize::MAX)
            .unwrap()
            .into_iter()
            .map(|n| n.path)
            .collect()
    }

    /// Every node's path equals parent path + "/" + name, and its parent is a folder.
    fn assert_tree_invariant(conn: &Connection) {
        let sql = format!("SELECT {} FROM nodes", Node::COLUMNS);
        let mut stmt = conn.prepare(&sql).unwrap();
        let nodes: Vec<Node> = stmt
            .query_map([], Node::from_row)
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        let by_id: HashMap<NodeId, &Node> = nodes.iter().map(|n| (n.id, n)).collect();

        for node in &nodes {
            match node.parent {
                None => assert_eq!(node.path, "/"),
                Some(pid) => {
                    let parent = by_id.get(&pid).expect("parent exists");
                    assert!(parent.is_folder(), "parent of {} is a folder", node.path);
                    assert_eq!(parent.account, node.account);
                    assert_eq!(node.path, path::join(&parent.path, &node.name));
                }
            }
        }
    }

    #[test]
    fn test_root_is_idempotent() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);
        tree.ensure_root().unwrap();

        let root = tree.get("/").unwrap().unwrap();
        assert!(root.is_folder());
        assert_eq!(root.parent, None);
        assert_eq!(root.rev, 1);
        assert_eq!(root.global_rev, 1);
    }

    #[test]
    fn test_get_missing_is_none() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);
        assert_eq!(tree.get("/nope").unwrap(), None);
        assert!(!tree.exists("/nope").unwrap());
    }

    #[test]
    fn test_create_file_requires_parent() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        let err = tree.create_file("/a/b.txt", &fp(1), 100).unwrap_err();
        assert!(matches!(err, VfsError::ParentMissing(_)));

        tree.create_folder("/a").unwrap();
        let node = tree.create_file("/a/b.txt", &fp(1), 100).unwrap();
        assert_eq!(node.path, "/a/b.txt");
        assert_eq!(node.name, "b.txt");
        assert_eq!(node.size, 100);
        assert_eq!(node.fingerprint, Some(fp(1)));
        assert_eq!((node.rev, node.global_rev), (1, 1));
    }

    #[test]
    fn test_create_under_file_fails() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_file("/f", &fp(1), 100).unwrap();
        assert!(matches!(
            tree.create_folder("/f/sub"),
            Err(VfsError::NotAFolder(_))
        ));
    }

    #[test]
    fn test_create_folder_conflict() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/docs").unwrap();
        assert!(matches!(
            tree.create_folder("/docs/"),
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            tree.create_file("/docs", &fp(1), 1),
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_list_orders_folders_first_then_name() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_file("/b.txt", &fp(1), 1).unwrap();
        tree.create_folder("/zeta").unwrap();
        tree.create_file("/a.txt", &fp(2), 1).unwrap();
        tree.create_folder("/alpha").unwrap();

        assert_eq!(paths(&tree, "/"), vec!["/alpha", "/zeta", "/a.txt", "/b.txt"]);

        let page: Vec<_> = tree
            .list_children("/", 1, 2)
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(page, vec!["zeta", "a.txt"]);
    }

    #[test]
    fn test_list_and_count_missing_or_file() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        assert!(matches!(
            tree.list_children("/missing", 0, 10),
            Err(VfsError::NotFound(_))
        ));
        assert!(matches!(
            tree.count_children("/missing"),
            Err(VfsError::NotFound(_))
        ));

        tree.create_file("/f", &fp(1), 1).unwrap();
        assert!(matches!(
            tree.list_children("/f", 0, 10),
            Err(VfsError::NotAFolder(_))
        ));
    }

    #[test]
    fn test_count_children_direct_only() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/a").unwrap();
        tree.create_folder("/a/b").unwrap();
        tree.create_file("/a/x", &fp(1), 1).unwrap();
        tree.create_file("/a/y", &fp(2), 1).unwrap();
        tree.create_file("/a/b/deep", &fp(3), 1).unwrap();

        assert_eq!(
            tree.count_children("/a").unwrap(),
            ChildCounts {
                folders: 1,
                files: 2
            }
        );
        assert_eq!(tree.count_children("/a/b").unwrap().files, 1);
    }

    #[test]
    fn test_rename_folder_rewrites_descendants_only() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/a").unwrap();
        tree.create_folder("/a/sub").unwrap();
        tree.create_file("/a/sub/f.txt", &fp(1), 10).unwrap();
        tree.create_file("/a/g.txt", &fp(2), 10).unwrap();
        tree.create_folder("/ab").unwrap();
        tree.create_file("/ab/h.txt", &fp(3), 10).unwrap();

        let renamed = tree.rename("/a", "b").unwrap();
        assert_eq!(renamed.path, "/b");
        assert_eq!(renamed.name, "b");

        assert!(tree.exists("/b/sub/f.txt").unwrap());
        assert!(tree.exists("/b/g.txt").unwrap());
        assert!(!tree.exists("/a").unwrap());
        assert!(!tree.exists("/a/sub/f.txt").unwrap());
        assert!(tree.exists("/ab/h.txt").unwrap());
        assert_tree_invariant(&conn);
    }

    #[test]
    fn test_rename_preserves_revisions() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        let before = tree.create_file("/f", &fp(1), 1).unwrap();
        let after = tree.rename("/f", "g").unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!((after.rev, after.global_rev), (1, 1));
    }

    #[test]
    fn test_rename_with_like_wildcards_in_names() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/a_").unwrap();
        tree.create_file("/a_/x", &fp(1), 1).unwrap();
        tree.create_folder("/ab").unwrap();
        tree.create_file("/ab/y", &fp(2), 1).unwrap();

        tree.rename("/a_", "c%").unwrap();
        assert!(tree.exists("/c%/x").unwrap());
        assert!(tree.exists("/ab/y").unwrap());
        assert_tree_invariant(&conn);
    }

    #[test]
    fn test_rename_non_ascii_prefix() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/Документы").unwrap();
        tree.create_file("/Документы/отчёт.pdf", &fp(1), 1).unwrap();
        tree.rename("/Документы", "Docs").unwrap();

        assert!(tree.exists("/Docs/отчёт.pdf").unwrap());
        assert_tree_invariant(&conn);
    }

    #[test]
    fn test_rename_errors() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_file("/x", &fp(1), 1).unwrap();
        tree.create_file("/y", &fp(2), 1).unwrap();

        assert!(matches!(tree.rename("/missing", "z"), Err(VfsError::NotFound(_))));
        assert!(matches!(tree.rename("/x", "y"), Err(VfsError::AlreadyExists(_))));
        assert!(matches!(tree.rename("/x", "a/b"), Err(VfsError::InvalidName(_))));
        assert!(matches!(tree.rename("/", "r"), Err(VfsError::InvalidOperation(_))));
    }

    #[test]
    fn test_move_folder_across_tree() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/src").unwrap();
        tree.create_folder("/src/proj").unwrap();
        tree.create_file("/src/proj/main.rs", &fp(1), 5).unwrap();
        tree.create_folder("/dst").unwrap();

        let moved = tree.move_to("/src/proj", "/dst").unwrap();
        assert_eq!(moved.path, "/dst/proj");
        assert_eq!(
            moved.parent,
            Some(tree.get("/dst").unwrap().unwrap().id)
        );
        assert!(tree.exists("/dst/proj/main.rs").unwrap());
        assert!(!tree.exists("/src/proj").unwrap());
        assert_tree_invariant(&conn);
    }

    #[test]
    fn test_move_errors() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/a").unwrap();
        tree.create_folder("/a/b").unwrap();
        tree.create_file("/f", &fp(1), 1).unwrap();

        assert!(matches!(tree.move_to("/missing", "/a"), Err(VfsError::NotFound(_))));
        assert!(matches!(
            tree.move_to("/f", "/missing"),
            Err(VfsError::TargetMissing(_))
        ));
        assert!(matches!(tree.move_to("/a", "/f"), Err(VfsError::NotAFolder(_))));
        assert!(matches!(
            tree.move_to("/a", "/a/b"),
            Err(VfsError::InvalidOperation(_))
        ));
        assert!(matches!(
            tree.move_to("/a", "/a"),
            Err(VfsError::InvalidOperation(_))
        ));

        tree.create_file("/a/f", &fp(2), 1).unwrap();
        assert!(matches!(tree.move_to("/f", "/a"), Err(VfsError::AlreadyExists(_))));
    }

    #[test]
    fn test_move_to_same_parent_is_noop() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        let node = tree.create_file("/f", &fp(1), 1).unwrap();
        assert_eq!(tree.move_to("/f", "/").unwrap(), node);
    }

    #[test]
    fn test_copy_file_shares_fingerprint() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/backup").unwrap();
        let original = tree.create_file("/report.pdf", &fp(9), 500).unwrap();
        let outcome = tree.copy_to("/report.pdf", "/backup").unwrap();

        assert_eq!(outcome.root.path, "/backup/report.pdf");
        assert_ne!(outcome.root.id, original.id);
        assert_eq!(outcome.root.fingerprint, original.fingerprint);
        assert_eq!(outcome.files, vec![(fp(9), 500)]);
        assert!(tree.exists("/report.pdf").unwrap());
    }

    #[test]
    fn test_copy_folder_recursively() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/p").unwrap();
        tree.create_folder("/p/q").unwrap();
        tree.create_folder("/p/q/r").unwrap();
        tree.create_file("/p/one", &fp(1), 1).unwrap();
        tree.create_file("/p/q/two", &fp(2), 2).unwrap();
        tree.create_file("/p/q/r/three", &fp(3), 3).unwrap();
        tree.create_folder("/dest").unwrap();

        let outcome = tree.copy_to("/p", "/dest").unwrap();
        assert_eq!(outcome.root.path, "/dest/p");
        assert_eq!(outcome.files.len(), 3);

        for p in ["/dest/p/one", "/dest/p/q/two", "/dest/p/q/r/three", "/p/q/r/three"] {
            assert!(tree.exists(p).unwrap(), "{} should exist", p);
        }

        let src = tree.get("/p/q/two").unwrap().unwrap();
        let dst = tree.get("/dest/p/q/two").unwrap().unwrap();
        assert_ne!(src.id, dst.id);
        assert_eq!(src.fingerprint, dst.fingerprint);
        assert_eq!((dst.rev, dst.global_rev), (1, 1));
        assert_eq!(tree.total_size().unwrap(), 12);
        assert_tree_invariant(&conn);
    }

    #[test]
    fn test_copy_errors() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/a").unwrap();
        tree.create_folder("/a/b").unwrap();

        assert!(matches!(tree.copy_to("/missing", "/a"), Err(VfsError::NotFound(_))));
        assert!(matches!(
            tree.copy_to("/a", "/a/b"),
            Err(VfsError::InvalidOperation(_))
        ));
        assert!(matches!(tree.copy_to("/a/b", "/a"), Err(VfsError::AlreadyExists(_))));
    }

    #[test]
    fn test_delete_cascades_and_is_idempotent() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/docs").unwrap();
        tree.create_folder("/docs/old").unwrap();
        tree.create_file("/docs/old/a", &fp(1), 10).unwrap();
        tree.create_file("/docs/b", &fp(2), 20).unwrap();
        tree.create_folder("/docs2").unwrap();

        let files = tree.subtree_files("/docs").unwrap();
        assert_eq!(files.len(), 2);

        assert_eq!(tree.delete("/docs").unwrap(), 4);
        assert!(!tree.exists("/docs/old/a").unwrap());
        assert!(tree.exists("/docs2").unwrap());

        assert_eq!(tree.delete("/docs").unwrap(), 0);
        assert_eq!(tree.delete("/never/was").unwrap(), 0);
        assert_tree_invariant(&conn);
    }

    #[test]
    fn test_delete_root_keeps_root() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("/a").unwrap();
        tree.create_file("/a/f", &fp(1), 5).unwrap();
        tree.delete("/").unwrap();

        assert!(tree.exists("/").unwrap());
        assert!(paths(&tree, "/").is_empty());
        assert_eq!(tree.total_size().unwrap(), 0);
    }

    #[test]
    fn test_accounts_are_isolated() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let mine = PathTree::new(&conn, ACCOUNT);
        let theirs = PathTree::new(&conn, ACCOUNT + 1);
        theirs.ensure_root().unwrap();

        mine.create_file("/same", &fp(1), 100).unwrap();
        theirs.create_file("/same", &fp(1), 100).unwrap();
        theirs.delete("/same").unwrap();

        assert!(mine.exists("/same").unwrap());
        assert_eq!(mine.total_size().unwrap(), 100);
        assert_eq!(theirs.total_size().unwrap(), 0);
    }

    #[test]
    fn test_free_path() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        assert_eq!(tree.free_path("/a.txt").unwrap(), "/a.txt");
        tree.create_file("/a.txt", &fp(1), 1).unwrap();
        assert_eq!(tree.free_path("/a.txt").unwrap(), "/a (1).txt");
        tree.create_file("/a (1).txt", &fp(1), 1).unwrap();
        assert_eq!(tree.free_path("/a.txt").unwrap(), "/a (2).txt");
    }

    #[test]
    fn test_normalization_applies_to_every_operation() {
        let (_temp, db) = setup();
        let conn = db.lock();
        let tree = PathTree::new(&conn, ACCOUNT);

        tree.create_folder("docs/").unwrap();
        tree.create_file("//docs/./x/../readme.txt", &fp(1), 1).unwrap();
        assert!(tree.get("/docs/readme.txt").unwrap().is_some());
        tree.rename("/docs//", "papers").unwrap();
        assert!(tree.exists("papers/readme.txt").unwrap());
    }
}
