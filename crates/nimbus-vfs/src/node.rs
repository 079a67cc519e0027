//! Filesystem nodes as stored in the `nodes` table.

use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use nimbus_cas::Fingerprint;

use crate::path::ROOT;
use crate::VfsError;

/// Opaque account identifier scoping every tree operation.
pub type AccountId = i64;

/// Row id of a node.
pub type NodeId = i64;

/// Entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Folder => "folder",
        }
    }
}

impl FromStr for NodeKind {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(NodeKind::File),
            "folder" => Ok(NodeKind::Folder),
            _ => Err(VfsError::Corrupt(format!("unknown node kind {:?}", s))),
        }
    }
}

/// Antivirus verdict reported for files. No scanner runs; every file passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirusScan {
    Pass,
}

/// One entry in an account's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub account: AccountId,
    /// `None` only for the root
    pub parent: Option<NodeId>,
    pub name: String,
    /// Always `parent.path + "/" + name`
    pub path: String,
    pub kind: NodeKind,
    /// Content size for files, 0 for folders
    pub size: u64,
    /// Present only for files
    pub fingerprint: Option<Fingerprint>,
    /// Unix seconds of the last create/rename/move
    pub modified_at: i64,
    pub rev: i64,
    pub global_rev: i64,
}

impl Node {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    pub fn is_root(&self) -> bool {
        self.path == ROOT
    }

    pub fn virus_scan(&self) -> Option<VirusScan> {
        self.is_file().then_some(VirusScan::Pass)
    }

    /// Column list matching [`Node::from_row`].
    pub(crate) const COLUMNS: &'static str =
        "id, account, parent_id, name, path, kind, size, fingerprint, modified_at, rev, grev";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind_str: String = row.get(5)?;
        let kind = kind_str
            .parse::<NodeKind>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

        let fingerprint = row
            .get::<_, Option<String>>(7)?
            .map(|s| s.parse::<Fingerprint>())
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

        let size: i64 = row.get(6)?;

        Ok(Node {
            id: row.get(0)?,
            account: row.get(1)?,
            parent: row.get(2)?,
            name: row.get(3)?,
            path: row.get(4)?,
            kind,
            size: size.max(0) as u64,
            fingerprint,
            modified_at: row.get(8)?,
            rev: row.get(9)?,
            global_rev: row.get(10)?,
        })
    }
}

/// Direct children of a folder, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildCounts {
    pub folders: u64,
    pub files: u64,
}
