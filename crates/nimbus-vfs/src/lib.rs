//! # nimbus-vfs
//!
//! Per-account virtual filesystem over a shared, deduplicated blob pool.
//!
//! - [`PathTree`]: the hierarchical namespace stored in SQLite
//! - [`ReferenceLedger`]: reference counts per content fingerprint
//! - [`Drive`]: the request-level operations tying both to the
//!   [`BlobStore`](nimbus_cas::BlobStore)
//!
//! A file add registers its fingerprint in the ledger and inserts the node in
//! one transaction; a delete decrements the ledger for every file it removes
//! and erases blobs whose count reached zero once the transaction commits.

pub mod db;
pub mod drive;
pub mod error;
pub mod ledger;
pub mod node;
pub mod path;
pub mod tree;

pub use db::Database;
pub use drive::{DeleteReport, Drive, DriveOptions, SpaceInfo, SweepReport};
pub use error::{ErrorKind, Result, VfsError};
pub use ledger::{ContentEntry, MemoryLedger, ReferenceLedger, SqliteLedger};
pub use nimbus_config::ConflictPolicy;
pub use node::{AccountId, ChildCounts, Node, NodeId, NodeKind, VirusScan};
pub use tree::{CopyOutcome, PathTree};
