//! # nimbus-config
//!
//! Configuration management for Nimbus.
//!
//! Loads configuration from:
//! 1. `~/.nimbus/config.toml` (global)
//! 2. `.nimbus/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tracing::debug;

pub use logging::{init_logging, LogLevel};

/// Default data directory, before home expansion.
pub const DEFAULT_DATA_DIR: &str = "~/.nimbus";

/// Default per-account quota: 8 GiB.
pub const DEFAULT_QUOTA_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub quota: QuotaConfig,
    pub drive: DriveConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let project_path = Path::new(".nimbus/config.toml");
        let mut config =
            Self::load_from(Self::global_config_path().as_deref(), Some(project_path))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from explicit global and project files, without env overrides.
    ///
    /// Missing files are skipped. Keys present in the project file replace
    /// the same keys from the global file; everything else falls back to
    /// defaults.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                debug!("Loading config from {:?}", path);
                let contents = std::fs::read_to_string(path)?;
                let table: toml::Table = toml::from_str(&contents)?;
                merge_tables(&mut merged, table);
            }
        }

        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.nimbus/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".nimbus/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = std::env::var("NIMBUS_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(quota) = std::env::var("NIMBUS_QUOTA_BYTES") {
            self.quota.bytes = quota.parse().map_err(|_| ConfigError::InvalidValue {
                key: "NIMBUS_QUOTA_BYTES",
                value: quota.clone(),
            })?;
        }
        if let Ok(level) = std::env::var("NIMBUS_LOG_LEVEL") {
            self.logging.level = level.parse()?;
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        // Every field is a plain scalar, so serialization cannot fail.
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Recursively overlay `overlay` onto `base`.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for the database and blob directory
    pub data_dir: PathBuf,
    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    /// Blob pool shared by all accounts.
    pub fn blob_root(&self) -> PathBuf {
        expand_home(&self.data_dir).join("blobs")
    }

    /// SQLite database holding nodes and the reference ledger.
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.data_dir).join("nimbus.db")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            busy_timeout_ms: 10_000,
        }
    }
}

/// Quota configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Per-account ceiling in bytes
    pub bytes: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            bytes: DEFAULT_QUOTA_BYTES,
        }
    }
}

/// What to do when a file is added at an occupied path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Fail with a conflict error.
    Strict,
    /// Pick the first free `name (N).ext`.
    #[default]
    Rename,
    /// Delete the existing node, then add.
    Replace,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictPolicy::Strict => "strict",
            ConflictPolicy::Rename => "rename",
            ConflictPolicy::Replace => "replace",
        })
    }
}

impl FromStr for ConflictPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(ConflictPolicy::Strict),
            "rename" => Ok(ConflictPolicy::Rename),
            "replace" | "rewrite" => Ok(ConflictPolicy::Replace),
            _ => Err(ConfigError::InvalidValue {
                key: "conflict",
                value: s.to_string(),
            }),
        }
    }
}

/// Drive behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Default conflict policy for adds and uploads
    pub conflict: ConflictPolicy,
    /// Upper bound on a listing page
    pub max_list_limit: usize,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            conflict: ConflictPolicy::default(),
            max_list_limit: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}
