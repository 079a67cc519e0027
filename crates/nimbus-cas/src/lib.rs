//! # nimbus-cas
//!
//! Content-addressable blob storage for Nimbus.
//!
//! Blobs are keyed by their [`Fingerprint`] and sharded two levels deep by
//! key prefix to bound directory fan-out. The pool is global: a blob written
//! for one account is reused by every other account holding the same bytes.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! └── AB/
//!     └── CD/
//!         └── ABCD1234...
//! ```
//!
//! Keys shorter than four characters are stored flat under `<root>`.

pub mod fingerprint;

pub use fingerprint::{
    fingerprint_file, fingerprint_reader, Fingerprint, StreamingHasher, FINGERPRINT_HEX_LEN,
    SMALL_CONTENT_LIMIT,
};

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, instrument};

const TEMP_EXTENSION: &str = "tmp";

/// Errors that can occur during blob store operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Blob not found: {key}")]
    NotFound { key: String },

    #[error("Invalid blob key: {0:?}")]
    InvalidKey(String),

    #[error("Invalid fingerprint: {0:?}")]
    InvalidFingerprint(String),

    #[error("Content of {size} bytes is fingerprinted verbatim and cannot be streamed")]
    SmallContentStream { size: u64 },

    #[error("Size mismatch: declared {declared} bytes, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
}

pub type Result<T> = std::result::Result<T, CasError>;

/// On-disk blob store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open a blob store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Physical location of `key`, whether or not the blob exists.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        match (key.get(..2), key.get(2..4)) {
            (Some(l1), Some(l2)) if key.len() >= 4 => Ok(self.root.join(l1).join(l2).join(key)),
            _ => Ok(self.root.join(key)),
        }
    }

    /// Write everything `reader` yields under `key` and return the byte count.
    ///
    /// Data lands in a temp file beside the final path and is renamed into
    /// place, so `open` never observes a partial blob. On failure the temp
    /// file is removed before the error is returned.
    #[instrument(skip(self, reader), level = "debug")]
    pub fn put<R: Read>(&self, key: &str, mut reader: R) -> Result<u64> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_file_name(format!(
            "{}.{}.{:?}.{}",
            key,
            std::process::id(),
            std::thread::current().id(),
            TEMP_EXTENSION
        ));

        let written = match write_file(&temp_path, &mut reader) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                error!(key, error = %e, "blob write failed, partial data removed");
                return Err(CasError::Io(e));
            }
        };

        // Concurrent writers of the same key carry identical bytes, so
        // replacing an existing blob is harmless.
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            error!(key, error = %e, "blob rename failed");
            return Err(CasError::Io(e));
        }

        debug!(key, bytes = written, "blob stored");
        Ok(written)
    }

    /// Fingerprint `data` and store it.
    pub fn store(&self, data: &[u8]) -> Result<Fingerprint> {
        let fp = Fingerprint::of(data);
        self.put(fp.as_str(), data)?;
        Ok(fp)
    }

    /// Open a blob for reading and seeking.
    #[instrument(skip(self), level = "debug")]
    pub fn open(&self, key: &str) -> Result<File> {
        let path = self.path_for(key)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CasError::NotFound {
                key: key.to_string(),
            },
            _ => CasError::Io(e),
        })
    }

    /// Read a whole blob into memory.
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open(key)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Length of a stored blob, or `None` if it is absent.
    pub fn size(&self, key: &str) -> Result<Option<u64>> {
        match fs::metadata(self.path_for(key)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Remove a blob. Removing an absent blob succeeds.
    #[instrument(skip(self), level = "debug")]
    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(key, "blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CasError::Io(e)),
        }
    }

    /// Keys of every stored blob, skipping in-flight temp files.
    pub fn iter(&self) -> impl Iterator<Item = Result<String>> + '_ {
        walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(3)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() || is_temp(entry.path()) {
                        return None;
                    }
                    entry.file_name().to_str().map(|s| Ok(s.to_string()))
                }
                Err(e) => Some(Err(CasError::Io(e.into()))),
            })
    }

    /// Count and total size of stored blobs.
    pub fn stats(&self) -> Result<BlobStats> {
        let mut stats = BlobStats::default();
        for key in self.iter() {
            let key = key?;
            let size = match fs::metadata(self.path_for(&key)?) {
                Ok(meta) => meta.len(),
                // Deleted between listing and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            stats.blob_count += 1;
            stats.total_bytes += size;
        }
        Ok(stats)
    }
}

/// Statistics about the blob store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobStats {
    /// Number of unique blobs stored
    pub blob_count: u64,
    /// Total bytes stored (deduplicated)
    pub total_bytes: u64,
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\\']) {
        return Err(CasError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn is_temp(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == TEMP_EXTENSION)
}

fn write_file<R: Read>(path: &Path, reader: &mut R) -> io::Result<u64> {
    let mut file = File::create(path)?;
    let written = io::copy(reader, &mut file)?;
    file.flush()?;
    file.sync_all()?;
    Ok(written)
}
