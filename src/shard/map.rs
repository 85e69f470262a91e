//! Bucket map and whitelist
//!
//! Both tables are loaded from YAML, rebuilt as a whole and swapped in with
//! a single pointer replace. Readers take a snapshot and never block.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ShardingConfig;
use crate::telemetry::{Event, EventKind, EventSink};

pub const FLAG_NOT_FOUND: u32 = 0x20;
pub const FLAG_BAD_LOGICAL: u32 = 0x10;
pub const FLAG_READ_STATUS_N: u32 = 0x08;
pub const FLAG_WRITE_STATUS_N: u32 = 0x02;
pub const FLAG_WHITELIST: u32 = 0x01;

/// Physical to logical mapping of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardMapRecord {
    pub bucket: usize,
    /// Logical shard, -1 when the bucket is bad
    pub logical: i32,
    pub flags: u32,
}

impl ShardMapRecord {
    pub fn logical(logical: i32) -> Self {
        Self {
            bucket: 0,
            logical,
            flags: 0,
        }
    }

    fn bad(bucket: usize) -> Self {
        Self {
            bucket,
            logical: -1,
            flags: FLAG_BAD_LOGICAL,
        }
    }

    pub fn is_bad(&self) -> bool {
        self.flags & FLAG_BAD_LOGICAL != 0
    }
}

fn status_flags(read_status: Option<&str>, write_status: Option<&str>) -> u32 {
    let mut flags = 0;
    if read_status.is_some_and(|s| s.starts_with('N')) {
        flags |= FLAG_READ_STATUS_N;
    }
    if write_status.is_some_and(|s| s.starts_with('N')) {
        flags |= FLAG_WRITE_STATUS_N;
    }
    flags
}

/// One row of the shard map file
#[derive(Debug, Clone, Deserialize)]
pub struct ShardMapEntry {
    pub bucket: i64,
    pub shard: i32,
    #[serde(default)]
    pub read_status: Option<String>,
    #[serde(default)]
    pub write_status: Option<String>,
}

/// Bucket to logical shard table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMap {
    records: Vec<ShardMapRecord>,
}

impl ShardMap {
    /// Spread `buckets` round-robin over `num_shards`
    pub fn uniform(buckets: usize, num_shards: usize) -> Self {
        let shards = num_shards.max(1);
        Self {
            records: (0..buckets)
                .map(|b| ShardMapRecord {
                    bucket: b,
                    logical: (b % shards) as i32,
                    flags: 0,
                })
                .collect(),
        }
    }

    /// Build from file rows. Out of range or doubly assigned buckets are
    /// skipped, bad logical shards and missing buckets become bad-logical.
    /// Returns the map and a description of every problem found.
    pub fn build(entries: &[ShardMapEntry], buckets: usize, num_shards: usize) -> (Self, Vec<String>) {
        let mut slots: Vec<Option<ShardMapRecord>> = vec![None; buckets];
        let mut problems = Vec::new();

        for e in entries {
            let in_range = usize::try_from(e.bucket).ok().filter(|b| *b < buckets);
            let Some(bucket) = in_range else {
                problems.push(format!("bucket {} out of range", e.bucket));
                continue;
            };
            if slots[bucket].is_some() {
                problems.push(format!("bucket {} set twice", bucket));
                continue;
            }
            let mut rec = ShardMapRecord {
                bucket,
                logical: e.shard,
                flags: status_flags(e.read_status.as_deref(), e.write_status.as_deref()),
            };
            if e.shard < 0 || e.shard as usize >= num_shards {
                problems.push(format!("bucket {} has bad logical shard {}", bucket, e.shard));
                rec.flags |= FLAG_BAD_LOGICAL;
                rec.logical = -1;
            }
            slots[bucket] = Some(rec);
        }

        let records = slots
            .into_iter()
            .enumerate()
            .map(|(bucket, slot)| {
                slot.unwrap_or_else(|| {
                    problems.push(format!("bucket {} not configured", bucket));
                    ShardMapRecord::bad(bucket)
                })
            })
            .collect();
        (Self { records }, problems)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, bucket: usize) -> ShardMapRecord {
        self.records
            .get(bucket)
            .copied()
            .unwrap_or(ShardMapRecord::bad(bucket))
    }
}

/// Shard key value as used for lookups
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardKeyValue {
    Num(u64),
    Str(String),
}

impl ShardKeyValue {
    /// Leading decimal digits of `raw`; anything else reads as 0
    pub fn numeric(raw: &str) -> Self {
        let n = raw
            .trim()
            .bytes()
            .take_while(u8::is_ascii_digit)
            .fold(0u64, |acc, d| acc.wrapping_mul(10).wrapping_add(u64::from(d - b'0')));
        ShardKeyValue::Num(n)
    }

    pub fn parse(raw: &str, as_string: bool) -> Self {
        if as_string {
            ShardKeyValue::Str(raw.to_string())
        } else {
            Self::numeric(raw)
        }
    }
}

/// One row of the whitelist file
#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistEntry {
    pub key: String,
    pub shard: i32,
    #[serde(default)]
    pub read_status: Option<String>,
    #[serde(default)]
    pub write_status: Option<String>,
}

/// Shard key values pinned to a logical shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    records: HashMap<ShardKeyValue, ShardMapRecord>,
}

impl Whitelist {
    pub fn build(entries: &[WhitelistEntry], keys_are_strings: bool) -> Self {
        let records = entries
            .iter()
            .map(|e| {
                let rec = ShardMapRecord {
                    bucket: 0,
                    logical: e.shard,
                    flags: FLAG_WHITELIST
                        | status_flags(e.read_status.as_deref(), e.write_status.as_deref()),
                };
                (ShardKeyValue::parse(&e.key, keys_are_strings), rec)
            })
            .collect();
        Self { records }
    }

    pub fn get(&self, key: &ShardKeyValue) -> Option<ShardMapRecord> {
        self.records.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read {:?}", path))?;
    serde_yaml::from_str(&content).context(format!("Failed to parse {:?}", path))
}

/// Current bucket map and whitelist
pub struct ShardMapStore {
    map: RwLock<Arc<ShardMap>>,
    whitelist: RwLock<Arc<Whitelist>>,
}

impl ShardMapStore {
    pub fn new(map: ShardMap) -> Self {
        Self {
            map: RwLock::new(Arc::new(map)),
            whitelist: RwLock::new(Arc::new(Whitelist::default())),
        }
    }

    /// Store seeded with a uniform map for `settings`
    pub fn from_settings(settings: &ShardingConfig) -> Self {
        Self::new(ShardMap::uniform(settings.max_scuttle, settings.num_shards))
    }

    pub fn map(&self) -> Arc<ShardMap> {
        self.map.read().clone()
    }

    pub fn whitelist(&self) -> Arc<Whitelist> {
        self.whitelist.read().clone()
    }

    /// Swap in a new map; returns whether anything changed
    pub fn replace_map(&self, next: ShardMap) -> bool {
        let mut guard = self.map.write();
        if **guard == next {
            return false;
        }
        *guard = Arc::new(next);
        true
    }

    pub fn replace_whitelist(&self, next: Whitelist) {
        *self.whitelist.write() = Arc::new(next);
    }

    /// Load the configured files; keeps the current tables on failure
    pub fn reload(&self, settings: &ShardingConfig, sink: &dyn EventSink) -> Result<()> {
        if let Some(path) = settings.shard_map_file.as_deref() {
            let entries: Vec<ShardMapEntry> = read_yaml(Path::new(path))?;
            let (map, problems) = ShardMap::build(&entries, settings.max_scuttle, settings.num_shards);
            for p in &problems {
                warn!(file = %path, "shard map: {}", p);
            }
            if !problems.is_empty() {
                sink.emit(
                    Event::new(EventKind::Sharding, "shard_map_problems")
                        .warning()
                        .with("count", problems.len()),
                );
            }
            if self.replace_map(map) {
                info!(file = %path, buckets = settings.max_scuttle, "shard map updated");
                sink.emit(Event::new(EventKind::Sharding, "shard_map_change"));
            }
        }

        if settings.whitelist_enabled {
            if let Some(path) = settings.whitelist_file.as_deref() {
                let entries: Vec<WhitelistEntry> = read_yaml(Path::new(path))?;
                let wl = Whitelist::build(&entries, settings.key_value_type_is_string);
                debug!(file = %path, entries = wl.len(), "whitelist loaded");
                self.replace_whitelist(wl);
            }
        }
        Ok(())
    }
}

/// Periodic reload of the shard map and whitelist files
pub struct ShardMapRefresher {
    store: Arc<ShardMapStore>,
    settings: ShardingConfig,
    sink: Arc<dyn EventSink>,
}

impl ShardMapRefresher {
    pub fn new(store: Arc<ShardMapStore>, settings: ShardingConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            settings,
            sink,
        }
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = Duration::from_millis(self.settings.reload_interval_ms.max(100));
            info!(interval_ms = interval.as_millis() as u64, "shard map refresher started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                if let Err(e) = self.store.reload(&self.settings, self.sink.as_ref()) {
                    warn!(error = %e, "shard map reload failed");
                    self.sink.emit(
                        Event::new(EventKind::Sharding, "no_shard_map")
                            .error()
                            .with("error", &e),
                    );
                }
            }
        })
    }
}
