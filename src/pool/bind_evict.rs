//! Hot bind value throttling
//!
//! When saturation recovery finds that one (fingerprint, bind name, bind
//! value) occupies a large share of the busy workers, those workers are
//! interrupted and a throttle is installed. The throttle lets one request in
//! every `allow_every_x` through, grows under heavy usage and decays under
//! light usage or idle time. At zero it is removed.
//!
//! The table is rebuilt and swapped as a whole, so readers never block on
//! writers and always see a consistent map.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::BindEvictionConfig;
use crate::protocol::BindPair;

/// Ceiling of `allow_every_x`
pub const MAX_ALLOW_EVERY_X: u64 = 10_000;

/// Allowance removed per request under light usage
const LIGHT_USAGE_DECR: u64 = 2;

/// Replace trailing digits with `#` so `:id1` and `:id2` group together.
/// Positional names such as `p1` or `:p1` are kept as is.
pub fn normalize_bind_name(name: &str) -> String {
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == name.len() {
        return name.to_string();
    }
    let normalized = format!("{}#", trimmed);
    if normalized == "p#" || normalized == ":p#" {
        return name.to_string();
    }
    normalized
}

fn throttle_key(name: &str, value: &str) -> String {
    format!("{}|{}", normalize_bind_name(name), value)
}

#[derive(Debug)]
struct ThrottleState {
    allow_every_x: u64,
    count: u64,
    recent_attempt: Instant,
    gap_start: Option<Instant>,
}

impl ThrottleState {
    fn incr(&mut self) {
        self.allow_every_x = (self.allow_every_x * 3 + 1).min(MAX_ALLOW_EVERY_X);
    }

    fn decr(&mut self, by: u64) {
        self.allow_every_x = self.allow_every_x.saturating_sub(by);
    }
}

/// Suppression state for one (fingerprint, name, value)
#[derive(Debug)]
pub struct BindThrottle {
    pub sql_hash: u32,
    pub name: String,
    pub value: String,
    state: Mutex<ThrottleState>,
}

impl BindThrottle {
    fn new(sql_hash: u32, name: &str, value: &str, allow_every_x: u64, now: Instant) -> Self {
        Self {
            sql_hash,
            name: name.to_string(),
            value: value.to_string(),
            state: Mutex::new(ThrottleState {
                allow_every_x: allow_every_x.min(MAX_ALLOW_EVERY_X),
                count: 0,
                recent_attempt: now,
                gap_start: None,
            }),
        }
    }

    pub fn allow_every_x(&self) -> u64 {
        self.state.lock().allow_every_x
    }

    pub fn recent_attempt(&self) -> Instant {
        self.state.lock().recent_attempt
    }
}

type ThrottleMap = HashMap<u32, HashMap<String, Arc<BindThrottle>>>;

/// Process-wide table of [`BindThrottle`]s keyed by fingerprint
pub struct BindEvictionTable {
    settings: BindEvictionConfig,
    name_filter: Vec<String>,
    throttles: RwLock<Arc<ThrottleMap>>,
}

impl BindEvictionTable {
    pub fn new(settings: BindEvictionConfig) -> Self {
        let name_filter = settings
            .names
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            settings,
            name_filter,
            throttles: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &BindEvictionConfig {
        &self.settings
    }

    fn snapshot(&self) -> Arc<ThrottleMap> {
        self.throttles.read().clone()
    }

    /// Whether a bind name is considered for eviction
    pub fn name_allowed(&self, name: &str) -> bool {
        if self.name_filter.is_empty() {
            return true;
        }
        let lower = name.to_lowercase();
        self.name_filter.iter().any(|f| lower.contains(f.as_str()))
    }

    /// Total throttles installed
    pub fn throttle_count(&self) -> usize {
        self.snapshot().values().map(HashMap::len).sum()
    }

    /// Whether any throttle exists for a fingerprint
    pub fn is_throttled(&self, sql_hash: u32) -> bool {
        self.snapshot().contains_key(&sql_hash)
    }

    pub fn get(&self, sql_hash: u32, name: &str, value: &str) -> Option<Arc<BindThrottle>> {
        self.snapshot()
            .get(&sql_hash)
            .and_then(|m| m.get(&throttle_key(name, value)))
            .cloned()
    }

    /// Install a throttle after evicting `workers` workers, or escalate the
    /// existing one
    pub fn install(&self, sql_hash: u32, name: &str, value: &str, workers: usize, now: Instant) {
        if let Some(existing) = self.get(sql_hash, name, value) {
            let mut s = existing.state.lock();
            s.incr();
            info!(sqlhash = sql_hash, bind = %name, allow_every_x = s.allow_every_x, "bind throttle escalated");
            return;
        }

        let throttle = Arc::new(BindThrottle::new(
            sql_hash,
            name,
            value,
            3 * workers as u64 + 1,
            now,
        ));
        let mut guard = self.throttles.write();
        let mut next = (**guard).clone();
        next.entry(sql_hash)
            .or_default()
            .entry(throttle_key(name, value))
            .or_insert(throttle);
        *guard = Arc::new(next);
        info!(sqlhash = sql_hash, bind = %name, workers, "bind throttle installed");
    }

    fn remove(&self, sql_hash: u32, key: &str) {
        let mut guard = self.throttles.write();
        let mut next = (**guard).clone();
        if let Some(per_sql) = next.get_mut(&sql_hash) {
            per_sql.remove(key);
            if per_sql.is_empty() {
                next.remove(&sql_hash);
            }
        }
        *guard = Arc::new(next);
        debug!(sqlhash = sql_hash, key = %key, "bind throttle removed");
    }

    /// Throttle gate for a request; returns the throttle that blocked it
    ///
    /// `heavy` means free workers are below the target share of the pool.
    /// `recovery_factor` adds to the idle decay when free workers are well
    /// above target.
    pub fn should_block(
        &self,
        sql_hash: u32,
        binds: &[BindPair],
        heavy: bool,
        recovery_factor: f64,
    ) -> Option<Arc<BindThrottle>> {
        self.should_block_at(sql_hash, binds, heavy, recovery_factor, Instant::now())
    }

    pub fn should_block_at(
        &self,
        sql_hash: u32,
        binds: &[BindPair],
        heavy: bool,
        recovery_factor: f64,
        now: Instant,
    ) -> Option<Arc<BindThrottle>> {
        let snap = self.snapshot();
        let per_sql = snap.get(&sql_hash)?;

        for bind in binds {
            let key = throttle_key(&bind.name, &bind.value);
            let Some(throttle) = per_sql.get(&key) else {
                continue;
            };

            let (blocked, exhausted) = {
                let mut s = throttle.state.lock();
                if heavy {
                    s.incr();
                    s.gap_start = None;
                } else {
                    s.decr(LIGHT_USAGE_DECR);
                    match s.gap_start {
                        None => s.gap_start = Some(now),
                        Some(gap) => {
                            let elapsed = now.saturating_duration_since(gap);
                            if elapsed >= Duration::from_secs(1) {
                                let decay = elapsed.as_secs_f64() * self.settings.decr_per_sec
                                    + recovery_factor.max(0.0).ceil();
                                s.decr(decay as u64);
                                s.gap_start = Some(now);
                            }
                        }
                    }
                }

                if s.allow_every_x == 0 {
                    (false, true)
                } else {
                    s.recent_attempt = now;
                    s.count += 1;
                    if s.count < s.allow_every_x {
                        (true, false)
                    } else {
                        s.count = 0;
                        (false, false)
                    }
                }
            };

            if exhausted {
                self.remove(sql_hash, &key);
            }
            return blocked.then(|| throttle.clone());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(name: &str, value: &str) -> BindPair {
        BindPair {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_normalize_bind_name() {
        assert_eq!(normalize_bind_name(":account_id2"), ":account_id#");
        assert_eq!(normalize_bind_name("num15"), "num#");
        assert_eq!(normalize_bind_name(":p3"), ":p3");
        assert_eq!(normalize_bind_name("p12"), "p12");
        assert_eq!(normalize_bind_name(":name"), ":name");
    }

    #[test]
    fn test_name_filter() {
        let table = BindEvictionTable::new(BindEvictionConfig::default());
        assert!(table.name_allowed(":ACCOUNT_ID"));
        assert!(table.name_allowed("order_num"));
        assert!(!table.name_allowed(":email"));

        let open = BindEvictionTable::new(BindEvictionConfig {
            names: String::new(),
            ..Default::default()
        });
        assert!(open.name_allowed(":email"));
    }

    #[test]
    fn test_install_and_escalate() {
        let table = BindEvictionTable::new(BindEvictionConfig::default());
        let now = Instant::now();

        table.install(7, ":id", "12345678", 3, now);
        assert_eq!(table.get(7, ":id", "12345678").unwrap().allow_every_x(), 10);
        assert_eq!(table.throttle_count(), 1);

        table.install(7, ":id", "12345678", 3, now);
        assert_eq!(table.get(7, ":id", "12345678").unwrap().allow_every_x(), 31);
        assert_eq!(table.throttle_count(), 1);
    }

    #[test]
    fn test_heavy_usage_saturates() {
        let table = BindEvictionTable::new(BindEvictionConfig::default());
        let now = Instant::now();
        table.install(1, ":id", "99999999", 3000, now);

        for _ in 0..5 {
            table.should_block_at(1, &[bind(":id", "99999999")], true, 0.0, now);
        }
        assert_eq!(table.get(1, ":id", "99999999").unwrap().allow_every_x(), MAX_ALLOW_EVERY_X);
    }

    #[test]
    fn test_unrelated_binds_pass() {
        let table = BindEvictionTable::new(BindEvictionConfig::default());
        let now = Instant::now();
        table.install(1, ":id", "12345678", 3, now);

        assert!(table
            .should_block_at(1, &[bind(":id", "87654321")], true, 0.0, now)
            .is_none());
        assert!(table
            .should_block_at(2, &[bind(":id", "12345678")], true, 0.0, now)
            .is_none());
    }
}
