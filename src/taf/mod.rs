//! Transparent failover between primary and standby pools
//!
//! Each shard keeps a probability, in percent, of trying the primary first.
//! Successes raise it quickly, failures lower it with a growing step so a
//! flapping primary is backed off. Statements that routinely time out on the
//! primary are tracked and given a longer deadline.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::config::TafConfig;
use crate::protocol::{codes, Frame};

/// Above this the primary is always tried
pub const PCT_MAX: u32 = 110;
const PCT_MIN: u32 = 1;
const PCT_STEP_UP: u32 = 10;
const PCT_STEP_DOWN_MAX: u32 = 10;
const DELTA_MAX: u32 = 64;

/// Failover state of one shard
#[derive(Debug)]
pub struct Taf {
    pct: AtomicU32,
    delta: AtomicU32,
}

impl Default for Taf {
    fn default() -> Self {
        Self {
            pct: AtomicU32::new(PCT_MAX),
            delta: AtomicU32::new(1),
        }
    }
}

impl Taf {
    pub fn use_primary(&self) -> bool {
        rand::thread_rng().gen_range(0..100) < self.pct()
    }

    pub fn notify_ok(&self) {
        let _ = self
            .pct
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some((p + PCT_STEP_UP).min(PCT_MAX))
            });
        let _ = self
            .delta
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some((d / 2).max(1)));
    }

    pub fn notify_error(&self) {
        let step = self.delta().min(PCT_STEP_DOWN_MAX);
        let _ = self
            .pct
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(p.saturating_sub(step).max(PCT_MIN))
            });
        let _ = self
            .delta
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some((d * 2).min(DELTA_MAX))
            });
    }

    pub fn pct(&self) -> u32 {
        self.pct.load(Ordering::Acquire)
    }

    pub fn delta(&self) -> u32 {
        self.delta.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct QueryRecord {
    bin_start: Instant,
    timeouts: u32,
}

#[derive(Debug, Default)]
struct QueryTable {
    records: HashMap<u32, QueryRecord>,
    count_fast: u64,
}

/// Per-fingerprint timeout history
///
/// Lookups never wait on the lock: under contention a statement is treated
/// as normally fast.
#[derive(Debug)]
pub struct TafQueries {
    table: Mutex<QueryTable>,
    bin_duration: Duration,
    allow_slow_every_x: u64,
    normally_slow_count: u32,
}

impl TafQueries {
    pub fn new(config: &TafConfig) -> Self {
        Self {
            table: Mutex::new(QueryTable::default()),
            bin_duration: Duration::from_secs(config.bin_duration_secs),
            allow_slow_every_x: config.allow_slow_every_x,
            normally_slow_count: config.normally_slow_count,
        }
    }

    /// Whether `sqlhash` should get the long deadline. Every
    /// `allow_slow_every_x` lookups a slow statement is still treated as fast
    /// so that a recovered primary is noticed.
    pub fn is_normally_slow(&self, sqlhash: u32) -> bool {
        self.is_normally_slow_at(sqlhash, Instant::now())
    }

    pub fn is_normally_slow_at(&self, sqlhash: u32, now: Instant) -> bool {
        let Some(mut table) = self.table.try_lock() else {
            return false;
        };
        let slow = match table.records.get_mut(&sqlhash) {
            Some(rec) => {
                if now.saturating_duration_since(rec.bin_start) > self.bin_duration {
                    rec.bin_start = now;
                    rec.timeouts = 0;
                }
                rec.timeouts >= self.normally_slow_count
            }
            None => false,
        };
        if !slow {
            table.count_fast += 1;
            return false;
        }
        if table.count_fast < self.allow_slow_every_x {
            return false;
        }
        table.count_fast = 0;
        true
    }

    pub fn record_timeout(&self, sqlhash: u32) {
        self.record_timeout_at(sqlhash, Instant::now());
    }

    pub fn record_timeout_at(&self, sqlhash: u32, now: Instant) {
        let Some(mut table) = self.table.try_lock() else {
            return;
        };
        let rec = table.records.entry(sqlhash).or_insert(QueryRecord {
            bin_start: now,
            timeouts: 0,
        });
        if now.saturating_duration_since(rec.bin_start) > self.bin_duration {
            rec.bin_start = now;
            rec.timeouts = 0;
        }
        rec.timeouts += 1;
    }
}

/// Failover state for every shard
#[derive(Debug)]
pub struct TafRegistry {
    shards: Vec<Taf>,
    queries: Vec<TafQueries>,
    config: TafConfig,
}

impl TafRegistry {
    pub fn new(config: &TafConfig, num_shards: usize) -> Self {
        let n = num_shards.max(1);
        Self {
            shards: (0..n).map(|_| Taf::default()).collect(),
            queries: (0..n).map(|_| TafQueries::new(config)).collect(),
            config: config.clone(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn index(&self, shard_id: usize) -> usize {
        shard_id.min(self.shards.len() - 1)
    }

    pub fn shard(&self, shard_id: usize) -> &Taf {
        &self.shards[self.index(shard_id)]
    }

    /// Timeout history of one shard's statements
    pub fn queries(&self, shard_id: usize) -> &TafQueries {
        &self.queries[self.index(shard_id)]
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    pub fn screen(&self) -> ResponseScreen<'_> {
        ResponseScreen {
            retryable: &self.config.retryable_codes,
            ok: true,
            sent: false,
        }
    }
}

/// Filters primary responses during a failover attempt
///
/// A SQL error whose number is retryable, arriving before anything was
/// relayed, marks the attempt failed and is not passed to the client.
#[derive(Debug)]
pub struct ResponseScreen<'a> {
    retryable: &'a [u32],
    pub ok: bool,
    pub sent: bool,
}

impl ResponseScreen<'_> {
    /// Decide whether `frame` reaches the client
    pub fn admit(&mut self, frame: &Frame) -> bool {
        if !self.sent && frame.cmd == codes::RC_SQL_ERROR && self.is_retryable(frame) {
            self.ok = false;
            return false;
        }
        self.sent = true;
        true
    }

    fn is_retryable(&self, frame: &Frame) -> bool {
        let text = frame.payload_str();
        let digits: String = text
            .trim_start()
            .trim_start_matches(|c: char| c.is_ascii_alphabetic() || c == '-')
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits
            .parse::<u32>()
            .map(|n| self.retryable.contains(&n))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pct_stays_in_bounds() {
        let taf = Taf::default();
        for _ in 0..200 {
            taf.notify_error();
            assert!(taf.pct() >= PCT_MIN);
            assert!(taf.delta() <= DELTA_MAX);
        }
        assert_eq!(taf.pct(), PCT_MIN);
        assert_eq!(taf.delta(), DELTA_MAX);

        for _ in 0..20 {
            taf.notify_ok();
            assert!(taf.pct() <= PCT_MAX);
        }
        assert_eq!(taf.pct(), PCT_MAX);
        assert_eq!(taf.delta(), 1);
    }

    #[test]
    fn test_error_steps_grow() {
        let taf = Taf::default();
        taf.notify_error();
        assert_eq!(taf.pct(), 109);
        taf.notify_error();
        assert_eq!(taf.pct(), 107);
        taf.notify_error();
        assert_eq!(taf.pct(), 103);
        taf.notify_error();
        assert_eq!(taf.pct(), 95);
        taf.notify_error();
        assert_eq!(taf.pct(), 85);
        taf.notify_ok();
        assert_eq!(taf.pct(), 95);
        assert_eq!(taf.delta(), 16);
    }

    #[test]
    fn test_always_primary_when_full() {
        let taf = Taf::default();
        assert!((0..100).all(|_| taf.use_primary()));
    }

    #[test]
    fn test_normally_slow_after_threshold() {
        let config = TafConfig {
            normally_slow_count: 2,
            allow_slow_every_x: 3,
            ..Default::default()
        };
        let q = TafQueries::new(&config);
        let now = Instant::now();

        assert!(!q.is_normally_slow_at(7, now));
        q.record_timeout_at(7, now);
        q.record_timeout_at(7, now);

        // three fast lookups bank up before the slow one is honored
        assert!(!q.is_normally_slow_at(1, now));
        assert!(!q.is_normally_slow_at(1, now));
        assert!(q.is_normally_slow_at(7, now));
        assert!(!q.is_normally_slow_at(7, now));
    }

    #[test]
    fn test_bin_expiry_resets_count() {
        let config = TafConfig {
            normally_slow_count: 1,
            allow_slow_every_x: 0,
            bin_duration_secs: 10,
            ..Default::default()
        };
        let q = TafQueries::new(&config);
        let now = Instant::now();
        q.record_timeout_at(3, now);
        assert!(q.is_normally_slow_at(3, now));
        assert!(!q.is_normally_slow_at(3, now + Duration::from_secs(11)));
    }

    #[test]
    fn test_slow_history_is_per_shard() {
        let config = TafConfig {
            normally_slow_count: 1,
            allow_slow_every_x: 0,
            ..Default::default()
        };
        let registry = TafRegistry::new(&config, 2);
        let now = Instant::now();

        registry.queries(1).record_timeout_at(11, now);
        assert!(registry.queries(1).is_normally_slow_at(11, now));
        assert!(!registry.queries(0).is_normally_slow_at(11, now));
        // out-of-range ids fall back to the last shard
        assert!(registry.queries(9).is_normally_slow_at(11, now));
    }

    #[test]
    fn test_screen_drops_retryable_error() {
        let registry = TafRegistry::new(&TafConfig::default(), 1);
        let mut screen = registry.screen();
        assert!(!screen.admit(&Frame::new(codes::RC_SQL_ERROR, "ORA-03113: end-of-file")));
        assert!(!screen.ok);

        let mut screen = registry.screen();
        assert!(screen.admit(&Frame::new(codes::RC_SQL_ERROR, "1: unique constraint")));
        assert!(screen.ok);

        let mut screen = registry.screen();
        assert!(screen.admit(&Frame::new(codes::RC_VALUE, "row")));
        assert!(screen.admit(&Frame::new(codes::RC_SQL_ERROR, "3113")));
        assert!(screen.ok);
    }
}
