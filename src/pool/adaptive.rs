//! Adaptive backlog, saturation recovery and bind eviction
//!
//! One manager per pool. Its mutable state lives inside the pool monitor
//! next to the idle queue, so pool and eviction logic share one lock.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bind_evict::{normalize_bind_name, BindEvictionTable};
use super::worker_pool::{PoolState, Ticket, WorkerPool};
use crate::config::{BacklogConfig, RuntimeTunables};
use crate::telemetry::{Event, EventKind, EventSink};
use crate::worker::{ControlMsg, WorkerClient, WorkerState};

/// Interval at which a disabled recovery loop checks whether it was enabled
const DISABLED_RECHECK: Duration = Duration::from_secs(30);

/// Bind values this short are never considered hot
const MIN_HOT_VALUE_LEN: usize = 8;

/// A checked-out worker as seen by the manager
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub worker: Arc<WorkerClient>,
    pub ticket: Ticket,
}

/// Manager state guarded by the pool monitor
#[derive(Debug)]
pub struct AqmState {
    /// Last moment the backlog was empty
    pub last_empty: Instant,

    /// Hard-evicted fingerprints and when they were evicted
    pub evicted: HashMap<u32, Instant>,

    /// Checked-out workers keyed by worker uid
    pub dispatched: HashMap<u64, Dispatched>,
}

impl AqmState {
    pub fn new(now: Instant) -> Self {
        Self {
            last_empty: now,
            evicted: HashMap::new(),
            dispatched: HashMap::new(),
        }
    }

    pub fn register(&mut self, worker: Arc<WorkerClient>, ticket: Ticket) {
        self.dispatched.insert(worker.uid(), Dispatched { worker, ticket });
    }

    pub fn unregister(&mut self, uid: u64) {
        self.dispatched.remove(&uid);
    }
}

/// Backlog timeout policy plus the saturation recovery loop
pub struct AdaptiveQueueManager {
    pool: Weak<WorkerPool>,
    backlog: BacklogConfig,
    tunables: Arc<RuntimeTunables>,
    bind_evict: Arc<BindEvictionTable>,
    sink: Arc<dyn EventSink>,
}

impl AdaptiveQueueManager {
    pub fn new(
        pool: Weak<WorkerPool>,
        backlog: BacklogConfig,
        tunables: Arc<RuntimeTunables>,
        bind_evict: Arc<BindEvictionTable>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            pool,
            backlog,
            tunables,
            bind_evict,
            sink,
        }
    }

    fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.backlog.request_backlog_timeout_ms)
    }

    fn short_timeout(&self) -> Duration {
        Duration::from_millis(self.backlog.short_backlog_timeout_ms)
    }

    /// How long a new arrival waits, and whether that is the long timeout
    ///
    /// An empty backlog gets the long timeout. Once the backlog has been
    /// non-empty for longer than the long timeout, arrivals only get the
    /// short one.
    pub fn backlog_timeout(&self, st: &AqmState, backlog: usize, now: Instant) -> (Duration, bool) {
        let long = self.long_timeout();
        if backlog == 0 {
            return (long, true);
        }
        if st.last_empty + long < now {
            (self.short_timeout(), false)
        } else {
            (long, true)
        }
    }

    /// Called by the last waiter leaving the backlog
    pub fn reset_if_last_backlog_entry(&self, st: &mut AqmState, backlog: usize, now: Instant) {
        if backlog == 1 {
            st.last_empty = now;
            st.evicted.clear();
        }
    }

    /// Whether to reject a fingerprint that was recently hard-evicted
    pub fn should_soft_evict(&self, st: &mut AqmState, sql_hash: u32, now: Instant) -> bool {
        let roll = rand::thread_rng().gen_range(0..100);
        self.should_soft_evict_with(st, sql_hash, now, roll)
    }

    /// [`Self::should_soft_evict`] with an explicit dice roll in `0..100`
    pub fn should_soft_evict_with(&self, st: &mut AqmState, sql_hash: u32, now: Instant, roll: u32) -> bool {
        if st.evicted.is_empty() {
            return false;
        }
        let probability = self.backlog.soft_eviction_probability;
        if probability == 0 {
            return false;
        }
        if probability < 100 && roll >= probability {
            return false;
        }
        let Some(&evicted_at) = st.evicted.get(&sql_hash) else {
            return false;
        };
        let window = Duration::from_millis(self.backlog.soft_eviction_effective_time_ms);
        if evicted_at + window < now {
            st.evicted.remove(&sql_hash);
            return false;
        }
        true
    }

    /// Whether saturation recovery should reclaim a worker now
    pub fn should_recover(
        throttle_rate: u32,
        throttle_count: u64,
        backlog: usize,
        stranded: usize,
        backlog_limit: usize,
    ) -> bool {
        if throttle_rate == 0 || backlog == 0 {
            return false;
        }
        if stranded as u64 > throttle_count {
            return false;
        }
        backlog >= backlog_limit + stranded
    }

    /// Longest-running dispatched worker past `threshold`; its request start
    /// is cleared so it is not picked twice. Finished workers are pruned.
    pub fn worker_to_recover(
        &self,
        st: &mut AqmState,
        threshold: Duration,
        now: Instant,
    ) -> Option<Arc<WorkerClient>> {
        st.dispatched
            .retain(|_, d| d.worker.state() != WorkerState::Finish);

        let mut best: Option<(Duration, Arc<WorkerClient>)> = None;
        for d in st.dispatched.values() {
            let Some(ran) = d.worker.telemetry().running_for(now) else {
                continue;
            };
            if ran <= threshold {
                continue;
            }
            if best.as_ref().map_or(true, |(b, _)| ran > *b) {
                best = Some((ran, d.worker.clone()));
            }
        }

        let (ran, worker) = best?;
        worker.telemetry().clear_sql_start();
        debug!(worker = %worker, ran_ms = ran.as_millis() as u64, "saturation candidate");
        Some(worker)
    }

    /// Interrupt every dispatched worker running the same hot bind value
    ///
    /// Returns how many workers were signalled.
    pub fn bind_eviction_pass(&self, st: &mut PoolState, now: Instant) -> usize {
        let settings = self.bind_evict.settings();
        if self.bind_evict.throttle_count() > settings.max_throttle {
            return 0;
        }

        let dispatched_total = st.aqm.dispatched.len();
        if dispatched_total == 0 {
            return 0;
        }

        let mut groups: HashMap<(u32, String, String), Vec<Dispatched>> = HashMap::new();
        for d in st.aqm.dispatched.values() {
            let sql_hash = d.worker.telemetry().sql_hash();
            if self.bind_evict.is_throttled(sql_hash) {
                continue;
            }
            for b in d.worker.binds() {
                if b.value.len() < MIN_HOT_VALUE_LEN {
                    continue;
                }
                let name = normalize_bind_name(&b.name);
                if !self.bind_evict.name_allowed(&name) {
                    continue;
                }
                groups
                    .entry((sql_hash, name, b.value.clone()))
                    .or_default()
                    .push(d.clone());
            }
        }

        let needed = settings.threshold_pct as f64 / 100.0 * dispatched_total as f64;
        let mut evicted_uids: Vec<u64> = Vec::new();
        for ((sql_hash, name, value), members) in groups {
            if (members.len() as f64) < needed {
                continue;
            }
            let mut signalled = 0;
            for d in &members {
                let uid = d.worker.uid();
                if evicted_uids.contains(&uid) {
                    continue;
                }
                let current = st.checkout_ticket(uid);
                if current != Some(d.ticket)
                    || d.worker.state() == WorkerState::Finish
                    || d.worker.telemetry().under_recovery()
                {
                    continue;
                }
                if d.worker.send_control(ControlMsg {
                    abort: true,
                    bind_evict: true,
                }) {
                    evicted_uids.push(uid);
                    signalled += 1;
                    self.sink.emit(
                        Event::new(EventKind::Eviction, "BIND_EVICT")
                            .warning()
                            .with("sqlhash", sql_hash)
                            .with("bind", &name)
                            .with("value", &value)
                            .with("worker", &*d.worker),
                    );
                }
            }
            if signalled > 0 {
                info!(sqlhash = sql_hash, bind = %name, workers = signalled, "hot bind value evicted");
                self.bind_evict
                    .install(sql_hash, &name, &value, members.len(), now);
            }
        }
        evicted_uids.len()
    }

    /// One recovery pass; returns the number of workers signalled
    pub fn saturation_pass(&self, pool: &WorkerPool, now: Instant) -> usize {
        let rate = self.tunables.saturation_throttle_rate();
        let throttle_count = self.tunables.throttle_count();
        let stranded = pool.counters().stranded() as usize;
        let backlog_limit = self.backlog.backlog_pct * pool.desired_size() / 100;

        let mut st = pool.lock_state();
        let backlog = st.backlog;
        if !Self::should_recover(rate, throttle_count, backlog, stranded, backlog_limit) {
            return 0;
        }

        let evicted = self.bind_eviction_pass(&mut st, now);
        if evicted > 0 {
            return evicted;
        }

        let threshold = self.tunables.saturation_threshold();
        let Some(worker) = self.worker_to_recover(&mut st.aqm, threshold, now) else {
            return 0;
        };
        if worker.state() == WorkerState::Finish {
            return 0;
        }

        let sql_hash = worker.telemetry().sql_hash();
        if !worker.send_control(ControlMsg {
            abort: true,
            bind_evict: false,
        }) {
            warn!(worker = %worker, "abort queue full, skipping saturation recovery");
            return 0;
        }
        st.aqm.evicted.insert(sql_hash, now);
        drop(st);

        info!(worker = %worker, sqlhash = sql_hash, backlog, pool = %pool.key(), "saturation recovery");
        self.sink.emit(
            Event::new(EventKind::Eviction, "HARD_EVICTION")
                .warning()
                .with("sqlhash", sql_hash)
                .with("worker", &*worker)
                .with("backlog", backlog),
        );
        1
    }

    /// Background loop; the interval is re-derived on every iteration
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval = self.tunables.saturation_interval();
                tokio::time::sleep(interval.unwrap_or(DISABLED_RECHECK)).await;

                let Some(pool) = self.pool.upgrade() else {
                    break;
                };
                if pool.is_shut_down() {
                    break;
                }
                if interval.is_some() {
                    self.saturation_pass(&pool, Instant::now());
                }
            }
            debug!("saturation recovery loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pool::{PoolDeps, PoolKey, StateRegistry};
    use crate::telemetry::NullSink;
    use crate::worker::sim::SimLauncher;
    use crate::worker::WorkerKind;

    fn manager(backlog: BacklogConfig) -> AdaptiveQueueManager {
        let config = Config::default();
        AdaptiveQueueManager::new(
            Weak::new(),
            backlog,
            Arc::new(RuntimeTunables::new(&config)),
            Arc::new(BindEvictionTable::new(config.bind_eviction.clone())),
            Arc::new(NullSink),
        )
    }

    #[test]
    fn test_sustained_backlog_switches_to_short_timeout() {
        let aqm = manager(BacklogConfig::default());
        let t0 = Instant::now();
        let mut st = AqmState::new(t0);

        assert_eq!(aqm.backlog_timeout(&st, 0, t0), (Duration::from_millis(1000), true));
        let young = t0 + Duration::from_millis(900);
        assert_eq!(aqm.backlog_timeout(&st, 3, young), (Duration::from_millis(1000), true));

        let old = t0 + Duration::from_millis(1001);
        assert_eq!(aqm.backlog_timeout(&st, 3, old), (Duration::from_millis(30), false));
        // an empty backlog always gets the long timeout
        assert_eq!(aqm.backlog_timeout(&st, 0, old), (Duration::from_millis(1000), true));

        // only the last waiter leaving resets the clock
        aqm.reset_if_last_backlog_entry(&mut st, 2, old);
        assert!(!aqm.backlog_timeout(&st, 1, old).1);
        aqm.reset_if_last_backlog_entry(&mut st, 1, old);
        assert_eq!(aqm.backlog_timeout(&st, 1, old), (Duration::from_millis(1000), true));
    }

    #[test]
    fn test_soft_eviction_expires() {
        let aqm = manager(BacklogConfig::default());
        let t0 = Instant::now();
        let mut st = AqmState::new(t0);
        st.evicted.insert(77, t0);

        assert!(aqm.should_soft_evict_with(&mut st, 77, t0, 10));
        // losing rolls and other fingerprints pass
        assert!(!aqm.should_soft_evict_with(&mut st, 77, t0, 50));
        assert!(!aqm.should_soft_evict_with(&mut st, 78, t0, 0));

        let inside = t0 + Duration::from_millis(9_999);
        assert!(aqm.should_soft_evict_with(&mut st, 77, inside, 0));

        let expired = t0 + Duration::from_millis(10_001);
        assert!(!aqm.should_soft_evict_with(&mut st, 77, expired, 0));
        assert!(!st.evicted.contains_key(&77));
    }

    #[test]
    fn test_soft_eviction_cleared_with_backlog() {
        let aqm = manager(BacklogConfig::default());
        let t0 = Instant::now();
        let mut st = AqmState::new(t0);
        st.evicted.insert(77, t0);

        aqm.reset_if_last_backlog_entry(&mut st, 1, t0);
        assert!(!aqm.should_soft_evict_with(&mut st, 77, t0, 0));
    }

    #[test]
    fn test_should_recover_gates() {
        assert!(!AdaptiveQueueManager::should_recover(0, 0, 10, 0, 2));
        assert!(!AdaptiveQueueManager::should_recover(100, 0, 0, 0, 2));
        assert!(!AdaptiveQueueManager::should_recover(100, 0, 1, 0, 2));
        assert!(AdaptiveQueueManager::should_recover(100, 0, 2, 0, 2));
        // stranded workers raise the bar and are capped by the throttle count
        assert!(!AdaptiveQueueManager::should_recover(100, 1, 2, 1, 2));
        assert!(AdaptiveQueueManager::should_recover(100, 1, 3, 1, 2));
        assert!(!AdaptiveQueueManager::should_recover(100, 0, 9, 1, 2));
    }

    #[tokio::test]
    async fn test_longest_running_worker_is_picked_once() {
        let config = Config::default();
        let tunables = Arc::new(RuntimeTunables::new(&config));
        let bind_evict = Arc::new(BindEvictionTable::new(config.bind_eviction.clone()));
        let deps = PoolDeps {
            tunables: tunables.clone(),
            launcher: Arc::new(SimLauncher::default()),
            registry: Arc::new(StateRegistry::new()),
            bind_evict,
            sink: Arc::new(NullSink),
        };
        let pool = WorkerPool::new(PoolKey::new(WorkerKind::ReadWrite, 0, 0), 3, &config, deps);
        pool.start();
        assert!(pool.wait_healthy(3, Duration::from_secs(2)).await);

        let (older, _) = pool.get_worker(1, None).await.unwrap();
        older.telemetry().mark_sql_start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (newer, _) = pool.get_worker(2, None).await.unwrap();
        newer.telemetry().mark_sql_start();
        let (done, _) = pool.get_worker(3, None).await.unwrap();
        done.telemetry().mark_sql_start();
        done.set_state(WorkerState::Finish);

        let aqm = pool.aqm().clone();
        let threshold = Duration::from_millis(50);
        let now = Instant::now() + Duration::from_millis(100);
        {
            let mut st = pool.lock_state();
            assert!(aqm.worker_to_recover(&mut st.aqm, Duration::from_secs(60), now).is_none());

            let first = aqm.worker_to_recover(&mut st.aqm, threshold, now).unwrap();
            assert_eq!(first.uid(), older.uid());
            assert!(!st.aqm.dispatched.contains_key(&done.uid()));

            let second = aqm.worker_to_recover(&mut st.aqm, threshold, now).unwrap();
            assert_eq!(second.uid(), newer.uid());
            assert!(aqm.worker_to_recover(&mut st.aqm, threshold, now).is_none());
        }

        pool.shutdown().await;
    }
}
