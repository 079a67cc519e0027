//! Integration tests for nimbus-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

use nimbus_config::{Config, ConflictPolicy, LogLevel};

/// Test config loading from real global config file
#[test]
fn test_load_global_config_from_file() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("config.toml");
    std::fs::write(
        &global,
        r#"
[storage]
data_dir = "/custom/nimbus"
busy_timeout_ms = 250

[quota]
bytes = 1048576

[drive]
conflict = "strict"
max_list_limit = 50

[logging]
level = "debug"
"#,
    )
    .unwrap();

    let config = Config::load_from(Some(&global), None).unwrap();

    assert_eq!(config.storage.data_dir, PathBuf::from("/custom/nimbus"));
    assert_eq!(config.storage.busy_timeout_ms, 250);
    assert_eq!(config.quota.bytes, 1_048_576);
    assert_eq!(config.drive.conflict, ConflictPolicy::Strict);
    assert_eq!(config.drive.max_list_limit, 50);
    assert_eq!(config.logging.level, LogLevel::Debug);
}

/// Test config hierarchy: project config overrides global key by key
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let global = temp.path().join("global.toml");
    std::fs::write(
        &global,
        r#"
[storage]
data_dir = "/global/nimbus"

[quota]
bytes = 1000

[drive]
conflict = "replace"
"#,
    )
    .unwrap();

    let project = temp.path().join("project.toml");
    std::fs::write(
        &project,
        r#"
[quota]
bytes = 2000
"#,
    )
    .unwrap();

    let config = Config::load_from(Some(&global), Some(&project)).unwrap();

    assert_eq!(config.quota.bytes, 2000);
    assert_eq!(config.storage.data_dir, PathBuf::from("/global/nimbus"));
    assert_eq!(config.drive.conflict, ConflictPolicy::Replace);
}

/// Missing files fall back to defaults
#[test]
fn test_missing_files_yield_defaults() {
    let temp = tempdir().unwrap();
    let config = Config::load_from(
        Some(&temp.path().join("nope.toml")),
        Some(&temp.path().join("also-nope.toml")),
    )
    .unwrap();
    assert_eq!(config, Config::default());
}

/// Test config with environment variable override
#[test]
fn test_config_env_override_integration() {
    let mut config = Config::default();

    std::env::set_var("NIMBUS_DATA_DIR", "/override/path");
    std::env::set_var("NIMBUS_QUOTA_BYTES", "4096");
    std::env::set_var("NIMBUS_LOG_LEVEL", "trace");

    let result = config.apply_env_overrides();

    std::env::remove_var("NIMBUS_DATA_DIR");
    std::env::remove_var("NIMBUS_QUOTA_BYTES");
    std::env::remove_var("NIMBUS_LOG_LEVEL");

    result.unwrap();
    assert_eq!(config.storage.data_dir, PathBuf::from("/override/path"));
    assert_eq!(config.quota.bytes, 4096);
    assert_eq!(config.logging.level, LogLevel::Trace);
}

/// Test partial config with defaults filling in
#[test]
fn test_partial_config_defaults_applied() {
    let partial = r#"
[drive]
conflict = "strict"
"#;
    let config: Config = toml::from_str(partial).unwrap();

    assert_eq!(config.drive.conflict, ConflictPolicy::Strict);
    assert_eq!(config.drive.max_list_limit, 1000);
    assert_eq!(config.quota.bytes, nimbus_config::DEFAULT_QUOTA_BYTES);
    assert_eq!(
        config.storage.data_dir,
        PathBuf::from(nimbus_config::DEFAULT_DATA_DIR)
    );
}

/// Malformed values surface as parse errors
#[test]
fn test_invalid_conflict_policy_rejected() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("config.toml");
    std::fs::write(&global, "[drive]\nconflict = \"sometimes\"\n").unwrap();

    assert!(Config::load_from(Some(&global), None).is_err());
}

/// The binary installs its subscriber through the crate-root export.
#[test]
fn test_init_logging_from_crate_root() {
    nimbus_config::init_logging(LogLevel::Warn);
    nimbus_config::log_cli_info!("subscriber installed", level = LogLevel::Warn.as_str());
}
