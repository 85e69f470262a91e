//! Configuration for the multiplexer
//!
//! The static configuration is a YAML document deserialized into [`Config`].
//! Every field has a serde default so an empty document is a valid config.
//! Values that may change while the server runs are mirrored into
//! [`RuntimeTunables`] which background loops re-read on every iteration.

mod runtime;

pub use runtime::RuntimeTunables;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::worker::WorkerKind;

/// Listener and process wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for client connections (default: 127.0.0.1:10101)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Worker program followed by its arguments
    #[serde(default)]
    pub worker_command: Vec<String>,

    /// Prefix of client-visible error codes, e.g. "HERA-100"
    #[serde(default = "default_error_code_prefix")]
    pub error_code_prefix: String,

    /// Tokio worker threads (0 = number of cores)
    #[serde(default)]
    pub worker_threads: usize,

    /// Reject new connections when no pool can serve them
    #[serde(default = "default_true")]
    pub bouncer_enabled: bool,

    /// Grace period after startup before the bouncer starts rejecting
    #[serde(default = "default_bouncer_startup_delay_ms")]
    pub bouncer_startup_delay_ms: u64,

    /// Frames buffered between a connection reader and its coordinator
    #[serde(default = "default_client_queue_depth")]
    pub client_queue_depth: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:10101".to_string()
}

fn default_error_code_prefix() -> String {
    "HERA".to_string()
}

fn default_true() -> bool {
    true
}

fn default_bouncer_startup_delay_ms() -> u64 {
    10_000
}

fn default_client_queue_depth() -> usize {
    8
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            worker_command: Vec::new(),
            error_code_prefix: default_error_code_prefix(),
            worker_threads: 0,
            bouncer_enabled: true,
            bouncer_startup_delay_ms: default_bouncer_startup_delay_ms(),
            client_queue_depth: default_client_queue_depth(),
        }
    }
}

/// Worker pool sizing and recycling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Total worker processes per shard
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Share of workers dedicated to read-only statements
    #[serde(default)]
    pub readonly_children_pct: usize,

    /// Hand out the most recently returned worker first
    #[serde(default = "default_true")]
    pub lifo_scheduler_enabled: bool,

    /// Recycle a worker after this many seconds (0 = never)
    #[serde(default)]
    pub max_lifespan_per_child_secs: u64,

    /// Recycle a worker after this many requests (0 = never)
    #[serde(default)]
    pub max_requests_per_child: u64,

    /// Interval of the idle-worker lifespan check
    #[serde(default = "default_lifespan_check_interval_secs")]
    pub lifespan_check_interval_secs: u64,

    /// Recycling is skipped below this share of healthy workers
    #[serde(default = "default_max_desire_healthy_worker_pct")]
    pub max_desire_healthy_worker_pct: usize,

    /// How long recovery waits for an interrupted worker to free itself
    #[serde(default = "default_max_stranded_time_interval_ms")]
    pub max_stranded_time_interval_ms: u64,

    /// Recover checked-out workers that stopped making progress
    #[serde(default)]
    pub enable_dangling_worker_recovery: bool,
}

fn default_num_workers() -> usize {
    6
}

fn default_lifespan_check_interval_secs() -> u64 {
    10
}

fn default_max_desire_healthy_worker_pct() -> usize {
    90
}

fn default_max_stranded_time_interval_ms() -> u64 {
    2000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            readonly_children_pct: 0,
            lifo_scheduler_enabled: true,
            max_lifespan_per_child_secs: 0,
            max_requests_per_child: 0,
            lifespan_check_interval_secs: default_lifespan_check_interval_secs(),
            max_desire_healthy_worker_pct: default_max_desire_healthy_worker_pct(),
            max_stranded_time_interval_ms: default_max_stranded_time_interval_ms(),
            enable_dangling_worker_recovery: false,
        }
    }
}

/// Backlog admission policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    /// Wait for a worker while the backlog is young
    #[serde(default = "default_request_backlog_timeout_ms")]
    pub request_backlog_timeout_ms: u64,

    /// Wait for a worker once the backlog has been non-empty for a long time
    #[serde(default = "default_short_backlog_timeout_ms")]
    pub short_backlog_timeout_ms: u64,

    /// Backlog size, as a share of the pool, at which the pool is saturated
    #[serde(default = "default_backlog_pct")]
    pub backlog_pct: usize,

    /// How long a hard-evicted fingerprint stays soft-evicted
    #[serde(default = "default_soft_eviction_effective_time_ms")]
    pub soft_eviction_effective_time_ms: u64,

    /// Chance, in percent, that a soft-evicted fingerprint is rejected
    #[serde(default = "default_soft_eviction_probability")]
    pub soft_eviction_probability: u32,
}

fn default_request_backlog_timeout_ms() -> u64 {
    1000
}

fn default_short_backlog_timeout_ms() -> u64 {
    30
}

fn default_backlog_pct() -> usize {
    30
}

fn default_soft_eviction_effective_time_ms() -> u64 {
    10_000
}

fn default_soft_eviction_probability() -> u32 {
    50
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            request_backlog_timeout_ms: default_request_backlog_timeout_ms(),
            short_backlog_timeout_ms: default_short_backlog_timeout_ms(),
            backlog_pct: default_backlog_pct(),
            soft_eviction_effective_time_ms: default_soft_eviction_effective_time_ms(),
            soft_eviction_probability: default_soft_eviction_probability(),
        }
    }
}

/// Saturation recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaturationConfig {
    /// Requests running longer than this are candidates for recovery
    #[serde(default = "default_recover_threshold_ms")]
    pub recover_threshold_ms: u64,

    /// Percent of the pool that may be reclaimed per second (0 disables)
    #[serde(default)]
    pub recover_throttle_rate: u32,
}

fn default_recover_threshold_ms() -> u64 {
    200
}

impl Default for SaturationConfig {
    fn default() -> Self {
        Self {
            recover_threshold_ms: default_recover_threshold_ms(),
            recover_throttle_rate: 0,
        }
    }
}

/// Hot bind value eviction and throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindEvictionConfig {
    /// Comma separated bind name fragments considered (empty = all)
    #[serde(default = "default_bind_eviction_names")]
    pub names: String,

    /// Share of dispatched workers one bind value must occupy to be evicted
    #[serde(default = "default_bind_eviction_threshold_pct")]
    pub threshold_pct: usize,

    /// Usage is heavy while free workers are below this share of the pool
    #[serde(default = "default_bind_eviction_target_conn_pct")]
    pub target_conn_pct: usize,

    /// No new throttles are installed beyond this many
    #[serde(default = "default_bind_eviction_max_throttle")]
    pub max_throttle: usize,

    /// Allowance decay per idle second
    #[serde(default = "default_bind_eviction_decr_per_sec")]
    pub decr_per_sec: f64,
}

fn default_bind_eviction_names() -> String {
    "id,num".to_string()
}

fn default_bind_eviction_threshold_pct() -> usize {
    60
}

fn default_bind_eviction_target_conn_pct() -> usize {
    50
}

fn default_bind_eviction_max_throttle() -> usize {
    20
}

fn default_bind_eviction_decr_per_sec() -> f64 {
    10.0
}

impl Default for BindEvictionConfig {
    fn default() -> Self {
        Self {
            names: default_bind_eviction_names(),
            threshold_pct: default_bind_eviction_threshold_pct(),
            target_conn_pct: default_bind_eviction_target_conn_pct(),
            max_throttle: default_bind_eviction_max_throttle(),
            decr_per_sec: default_bind_eviction_decr_per_sec(),
        }
    }
}

/// Shard key to bucket reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShardingAlgo {
    /// murmur3 of the key
    #[default]
    Hash,
    /// numeric key modulo bucket count
    Mod,
}

/// Shard routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Resolve keys through the bucket map (otherwise everything is shard 0)
    #[serde(default = "default_true")]
    pub use_shard_map: bool,

    #[serde(default = "default_num_shards")]
    pub num_shards: usize,

    /// Bind name carrying the shard key; matched case-insensitively
    #[serde(default)]
    pub shard_key_name: String,

    /// Number of buckets in the shard map
    #[serde(default = "default_max_scuttle")]
    pub max_scuttle: usize,

    /// Bucket column that must not be selected by clients
    #[serde(default = "default_scuttle_col_name")]
    pub scuttle_col_name: String,

    #[serde(default)]
    pub algo: ShardingAlgo,

    #[serde(default)]
    pub whitelist_enabled: bool,

    /// Reject writes that switch shard key value inside a transaction
    #[serde(default)]
    pub cross_keys_err: bool,

    /// Shard key values are hashed as strings instead of numbers
    #[serde(default)]
    pub key_value_type_is_string: bool,

    /// YAML list of bucket assignments
    #[serde(default)]
    pub shard_map_file: Option<String>,

    /// YAML list of whitelisted shard keys
    #[serde(default)]
    pub whitelist_file: Option<String>,

    #[serde(default = "default_shard_reload_interval_ms")]
    pub reload_interval_ms: u64,
}

fn default_num_shards() -> usize {
    1
}

fn default_max_scuttle() -> usize {
    1024
}

fn default_scuttle_col_name() -> String {
    "scuttle_id".to_string()
}

fn default_shard_reload_interval_ms() -> u64 {
    2000
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            use_shard_map: true,
            num_shards: default_num_shards(),
            shard_key_name: String::new(),
            max_scuttle: default_max_scuttle(),
            scuttle_col_name: default_scuttle_col_name(),
            algo: ShardingAlgo::Hash,
            whitelist_enabled: false,
            cross_keys_err: false,
            key_value_type_is_string: false,
            shard_map_file: None,
            whitelist_file: None,
            reload_interval_ms: default_shard_reload_interval_ms(),
        }
    }
}

/// Transparent failover between primary and standby pools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TafConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Primary attempt deadline before falling back
    #[serde(default = "default_taf_timeout_ms")]
    pub timeout_ms: u64,

    /// Window over which timeouts of one fingerprint are counted
    #[serde(default = "default_taf_bin_duration_secs")]
    pub bin_duration_secs: u64,

    /// A normally slow statement may still fail over once per this many runs
    #[serde(default = "default_taf_allow_slow_every_x")]
    pub allow_slow_every_x: u64,

    /// Timeouts within a bin after which a statement is normally slow
    #[serde(default = "default_taf_normally_slow_count")]
    pub normally_slow_count: u32,

    /// Database error numbers that trigger failover
    #[serde(default = "default_taf_retryable_codes")]
    pub retryable_codes: Vec<u32>,
}

fn default_taf_timeout_ms() -> u64 {
    200
}

fn default_taf_bin_duration_secs() -> u64 {
    86_400
}

fn default_taf_allow_slow_every_x() -> u64 {
    100
}

fn default_taf_normally_slow_count() -> u32 {
    5
}

fn default_taf_retryable_codes() -> Vec<u32> {
    let mut codes = vec![
        3113, 3114, 3135, 12514, 3128, 3127, 3123, 3111, 3106, 1012, 28, 31, 51,
    ];
    codes.extend(25400..=25405);
    codes.extend(25407..=25409);
    codes.extend([25425, 24343, 1041, 600, 700, 7445]);
    codes
}

impl Default for TafConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: default_taf_timeout_ms(),
            bin_duration_secs: default_taf_bin_duration_secs(),
            allow_slow_every_x: default_taf_allow_slow_every_x(),
            normally_slow_count: default_taf_normally_slow_count(),
            retryable_codes: default_taf_retryable_codes(),
        }
    }
}

/// Client session timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Close a session without a worker after this much silence
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Close a session holding a worker after this much silence
    #[serde(default = "default_transaction_idle_timeout_ms")]
    pub transaction_idle_timeout_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_transaction_idle_timeout_ms() -> u64 {
    900_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            transaction_idle_timeout_ms: default_transaction_idle_timeout_ms(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub backlog: BacklogConfig,

    #[serde(default)]
    pub saturation: SaturationConfig,

    #[serde(default)]
    pub bind_eviction: BindEvictionConfig,

    #[serde(default)]
    pub sharding: ShardingConfig,

    #[serde(default)]
    pub taf: TafConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Normalize values the way the server interprets them
    pub fn normalize(&mut self) {
        if self.saturation.recover_throttle_rate > 100 {
            self.saturation.recover_throttle_rate = 0;
        }
        self.sharding.shard_key_name = self.sharding.shard_key_name.to_lowercase();
        self.bind_eviction.names = self.bind_eviction.names.to_lowercase();
    }

    /// Reject combinations the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool.num_workers == 0 {
            anyhow::bail!("pool.num_workers must be at least 1");
        }
        if self.pool.readonly_children_pct >= 100 {
            anyhow::bail!("pool.readonly_children_pct must be below 100");
        }
        if self.sharding.num_shards == 0 {
            anyhow::bail!("sharding.num_shards must be at least 1");
        }
        if self.sharding.max_scuttle == 0 {
            anyhow::bail!("sharding.max_scuttle must be at least 1");
        }
        if self.sharding.enabled && self.sharding.shard_key_name.is_empty() {
            anyhow::bail!("sharding.shard_key_name is required when sharding is enabled");
        }
        if self.backlog.soft_eviction_probability > 100 {
            anyhow::bail!("backlog.soft_eviction_probability must be within 0..=100");
        }
        if self.bind_eviction.decr_per_sec < 0.0 {
            anyhow::bail!("bind_eviction.decr_per_sec must not be negative");
        }
        Ok(())
    }

    /// Number of shards the broker builds pools for
    pub fn shard_count(&self) -> usize {
        if self.sharding.enabled {
            self.sharding.num_shards
        } else {
            1
        }
    }

    /// Size of one pool of `kind` given the total worker count per shard
    pub fn pool_size(&self, kind: WorkerKind, total: usize) -> usize {
        let ro = total * self.pool.readonly_children_pct / 100;
        match kind {
            WorkerKind::ReadOnly => ro,
            WorkerKind::ReadWrite => total - ro,
            WorkerKind::Standby => total,
        }
    }

    pub fn stranded_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.max_stranded_time_interval_ms)
    }

    pub fn taf_timeout(&self) -> Duration {
        Duration::from_millis(self.taf.timeout_ms)
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(val) = raw.trim().parse() {
            *slot = val;
        }
    }
}

/// Apply `DBMUX_*` environment overrides on top of `config`
///
/// A `.env` file in the working directory is loaded first if present.
/// Recognized variables:
/// - DBMUX_LISTEN
/// - DBMUX_WORKER_COMMAND (whitespace separated)
/// - DBMUX_NUM_WORKERS
/// - DBMUX_READONLY_PCT
/// - DBMUX_BACKLOG_TIMEOUT_MS
/// - DBMUX_SHORT_BACKLOG_TIMEOUT_MS
/// - DBMUX_SATURATION_THRESHOLD_MS
/// - DBMUX_SATURATION_THROTTLE_RATE
/// - DBMUX_ENABLE_TAF
/// - DBMUX_ENABLE_SHARDING
/// - DBMUX_NUM_SHARDS
pub fn apply_env_overrides(config: &mut Config) {
    let _ = dotenvy::dotenv();

    if let Ok(listen) = std::env::var("DBMUX_LISTEN") {
        config.server.listen_addr = listen;
    }

    if let Ok(cmd) = std::env::var("DBMUX_WORKER_COMMAND") {
        config.server.worker_command = cmd.split_whitespace().map(str::to_string).collect();
    }

    env_parse("DBMUX_NUM_WORKERS", &mut config.pool.num_workers);
    env_parse("DBMUX_READONLY_PCT", &mut config.pool.readonly_children_pct);
    env_parse(
        "DBMUX_BACKLOG_TIMEOUT_MS",
        &mut config.backlog.request_backlog_timeout_ms,
    );
    env_parse(
        "DBMUX_SHORT_BACKLOG_TIMEOUT_MS",
        &mut config.backlog.short_backlog_timeout_ms,
    );
    env_parse(
        "DBMUX_SATURATION_THRESHOLD_MS",
        &mut config.saturation.recover_threshold_ms,
    );
    env_parse(
        "DBMUX_SATURATION_THROTTLE_RATE",
        &mut config.saturation.recover_throttle_rate,
    );
    env_parse("DBMUX_ENABLE_TAF", &mut config.taf.enabled);
    env_parse("DBMUX_ENABLE_SHARDING", &mut config.sharding.enabled);
    env_parse("DBMUX_NUM_SHARDS", &mut config.sharding.num_shards);
}

/// Load configuration from file (or defaults), apply environment overrides,
/// normalize and validate.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config);
    config.normalize();
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.pool.num_workers, 6);
        assert_eq!(config.backlog.request_backlog_timeout_ms, 1000);
        assert_eq!(config.backlog.short_backlog_timeout_ms, 30);
        assert_eq!(config.bind_eviction.names, "id,num");
        assert_eq!(config.sharding.scuttle_col_name, "scuttle_id");
        assert_eq!(config.sharding.algo, ShardingAlgo::Hash);
        assert!(config.pool.lifo_scheduler_enabled);
        assert!(config.taf.retryable_codes.contains(&25409));
        assert!(!config.taf.retryable_codes.contains(&25406));
    }

    #[test]
    fn test_normalize() {
        let yaml = r#"
saturation:
  recover_throttle_rate: 150
sharding:
  shard_key_name: AccountID
  algo: mod
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.normalize();

        assert_eq!(config.saturation.recover_throttle_rate, 0);
        assert_eq!(config.sharding.shard_key_name, "accountid");
        assert_eq!(config.sharding.algo, ShardingAlgo::Mod);
    }

    #[test]
    fn test_pool_size_split() {
        let mut config = Config::default();
        config.pool.readonly_children_pct = 30;

        assert_eq!(config.pool_size(WorkerKind::ReadOnly, 10), 3);
        assert_eq!(config.pool_size(WorkerKind::ReadWrite, 10), 7);
        assert_eq!(config.pool_size(WorkerKind::Standby, 10), 10);
    }

    #[test]
    fn test_validate_rejects_sharding_without_key() {
        let mut config = Config::default();
        config.sharding.enabled = true;

        assert!(config.validate().is_err());

        config.sharding.shard_key_name = "account_id".to_string();
        assert!(config.validate().is_ok());
    }
}
