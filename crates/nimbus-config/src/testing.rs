//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated data directory (database + blob pool)
//! - A `Config` pointing at it
//! - Scratch space for local source files
//!
//! # Usage
//!
//! ```ignore
//! use nimbus_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.config.storage.db_path() and blob_root() are isolated
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Data directory holding the database and blobs
    pub data_dir: PathBuf,
    /// Scratch directory for local files fed to uploads
    pub scratch_dir: PathBuf,
    /// Config rooted at `data_dir`
    pub config: Config,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let data_dir = root.join("data");
        let scratch_dir = root.join("scratch");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&scratch_dir)?;

        let mut config = Config::default();
        config.storage.data_dir = data_dir.clone();

        Ok(Self {
            _temp_dir: temp_dir,
            data_dir,
            scratch_dir,
            config,
            test_id,
        })
    }

    /// Same as [`TestEnvironment::new`] with a custom quota.
    pub fn with_quota(bytes: u64) -> anyhow::Result<Self> {
        let mut env = Self::new()?;
        env.config.quota.bytes = bytes;
        Ok(env)
    }

    pub fn blob_root(&self) -> PathBuf {
        self.config.storage.blob_root()
    }

    pub fn db_path(&self) -> PathBuf {
        self.config.storage.db_path()
    }

    /// Create a local file with content under the scratch directory
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.scratch_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
