use std::io;

use nimbus_cas::{CasError, Fingerprint};
use thiserror::Error;

/// Errors raised by the path tree, the reference ledger and the drive.
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Parent folder missing for {0}")]
    ParentMissing(String),

    #[error("Target folder missing: {0}")]
    TargetMissing(String),

    #[error("Not a folder: {0}")]
    NotAFolder(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Quota exceeded: {used} used + {requested} requested > {quota}")]
    QuotaExceeded { used: u64, requested: u64, quota: u64 },

    #[error("Content not found, upload required: {0}")]
    ContentNotFound(Fingerprint),

    #[error("Content {fingerprint} is already stored with {stored} bytes, not {size}")]
    ContentCollision {
        fingerprint: Fingerprint,
        stored: u64,
        size: u64,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Blob store error: {0}")]
    Cas(#[from] CasError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Tree corrupted: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, VfsError>;

/// Coarse classification for callers mapping errors onto a wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PreconditionFailed,
    Conflict,
    QuotaExceeded,
    InvalidArgument,
    Storage,
}

impl VfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VfsError::NotFound(_) | VfsError::ContentNotFound(_) => ErrorKind::NotFound,
            VfsError::ParentMissing(_)
            | VfsError::TargetMissing(_)
            | VfsError::NotAFolder(_)
            | VfsError::NotAFile(_) => ErrorKind::PreconditionFailed,
            VfsError::AlreadyExists(_) | VfsError::ContentCollision { .. } => ErrorKind::Conflict,
            VfsError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            VfsError::InvalidName(_) | VfsError::InvalidOperation(_) => {
                ErrorKind::InvalidArgument
            }
            VfsError::Database(_) | VfsError::Cas(_) | VfsError::Io(_) | VfsError::Corrupt(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Stable short code for logs and wire responses.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "not_found",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::Conflict => "conflict",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Storage => "storage",
        }
    }
}
