use std::env;
use std::fs;
use tempfile::TempDir;

use dbmux::config::{load_config, load_from_yaml, ShardingAlgo};
use dbmux::worker::WorkerKind;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
server:
  listen_addr: "127.0.0.1:11000"
  worker_command: ["/usr/bin/dbworker", "--db", "main"]
  error_code_prefix: OCC

pool:
  num_workers: 12
  readonly_children_pct: 25
  lifo_scheduler_enabled: false

backlog:
  request_backlog_timeout_ms: 500
  backlog_pct: 40

sharding:
  enabled: true
  num_shards: 4
  shard_key_name: AccountID
  algo: mod
  max_scuttle: 128

taf:
  enabled: true
  timeout_ms: 150
  retryable_codes: [3113, 3114]
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("dbmux.yaml");
    fs::write(&config_path, yaml).unwrap();

    let mut config = load_from_yaml(&config_path).unwrap();
    config.normalize();
    config.validate().unwrap();

    assert_eq!(config.server.listen_addr, "127.0.0.1:11000");
    assert_eq!(config.server.worker_command.len(), 3);
    assert_eq!(config.server.error_code_prefix, "OCC");

    assert_eq!(config.pool.num_workers, 12);
    assert!(!config.pool.lifo_scheduler_enabled);
    assert_eq!(config.pool_size(WorkerKind::ReadOnly, 12), 3);
    assert_eq!(config.pool_size(WorkerKind::ReadWrite, 12), 9);

    assert_eq!(config.backlog.request_backlog_timeout_ms, 500);
    assert_eq!(config.backlog.short_backlog_timeout_ms, 30);
    assert_eq!(config.backlog.backlog_pct, 40);

    assert_eq!(config.shard_count(), 4);
    assert_eq!(config.sharding.shard_key_name, "accountid");
    assert_eq!(config.sharding.algo, ShardingAlgo::Mod);
    assert_eq!(config.sharding.max_scuttle, 128);

    assert!(config.taf.enabled);
    assert_eq!(config.taf.retryable_codes, vec![3113, 3114]);
    assert_eq!(config.taf_timeout().as_millis(), 150);
}

#[test]
fn test_invalid_yaml_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("broken.yaml");
    fs::write(&config_path, "pool: [unclosed").unwrap();

    assert!(load_from_yaml(&config_path).is_err());
    assert!(load_from_yaml(temp_dir.path().join("missing.yaml")).is_err());
}

#[test]
fn test_validation_rejects_bad_values() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("bad.yaml");
    fs::write(&config_path, "pool:\n  readonly_children_pct: 100\n").unwrap();

    let config = load_from_yaml(&config_path).unwrap();
    assert!(config.validate().is_err());
}

/// Environment overrides win over the file
#[test]
fn test_env_overrides() {
    let orig_workers = env::var("DBMUX_NUM_WORKERS").ok();
    let orig_listen = env::var("DBMUX_LISTEN").ok();
    let orig_taf = env::var("DBMUX_ENABLE_TAF").ok();

    env::set_var("DBMUX_NUM_WORKERS", "3");
    env::set_var("DBMUX_LISTEN", "0.0.0.0:12345");
    env::set_var("DBMUX_ENABLE_TAF", "true");

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("dbmux.yaml");
    fs::write(&config_path, "pool:\n  num_workers: 20\n").unwrap();

    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();

    assert_eq!(config.pool.num_workers, 3);
    assert_eq!(config.server.listen_addr, "0.0.0.0:12345");
    assert!(config.taf.enabled);

    match orig_workers {
        Some(v) => env::set_var("DBMUX_NUM_WORKERS", v),
        None => env::remove_var("DBMUX_NUM_WORKERS"),
    }
    match orig_listen {
        Some(v) => env::set_var("DBMUX_LISTEN", v),
        None => env::remove_var("DBMUX_LISTEN"),
    }
    match orig_taf {
        Some(v) => env::set_var("DBMUX_ENABLE_TAF", v),
        None => env::remove_var("DBMUX_ENABLE_TAF"),
    }
}
