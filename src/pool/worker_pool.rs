//! Worker pool: checkout, return, backlog, resize and recycling
//!
//! Every worker slot is backed by one task that spawns the process, performs
//! the handshake, runs the read loop and restarts the slot when the process
//! goes away. Idle workers sit in the active queue; checked-out workers are
//! tracked by ticket.

use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::adaptive::{AdaptiveQueueManager, AqmState};
use super::bind_evict::BindEvictionTable;
use super::monitor::PoolMonitor;
use super::state::{PoolKey, PoolStateCounters, StateRegistry};
use crate::config::{Config, RuntimeTunables};
use crate::error::MuxError;
use crate::telemetry::{Event, EventKind, EventSink};
use crate::worker::{ControlMsg, ProcessLauncher, SpawnRequest, WorkerClient, WorkerSpec, WorkerState};

/// Delay before a failed worker start is retried
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Healthy means at least this percent of the desired workers are connected
const HEALTHY_PCT: usize = 20;

/// Proof of exclusive checkout of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

impl Ticket {
    /// Never issued; returning with it always fails
    pub const EMPTY: Ticket = Ticket(0);

    fn mint() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let v: u64 = rng.gen();
            if v != 0 {
                return Ticket(v);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug)]
enum Slot {
    Empty,
    Starting,
    Running(Arc<WorkerClient>),
}

/// Everything guarded by the pool monitor
#[derive(Debug)]
pub struct PoolState {
    active: VecDeque<Arc<WorkerClient>>,
    slots: Vec<Slot>,
    checkout: HashMap<u64, Ticket>,
    desired: usize,

    /// Callers waiting for a worker
    pub backlog: usize,

    pub aqm: AqmState,
}

impl PoolState {
    fn new(desired: usize, now: Instant) -> Self {
        Self {
            active: VecDeque::with_capacity(desired),
            slots: (0..desired).map(|_| Slot::Empty).collect(),
            checkout: HashMap::new(),
            desired,
            backlog: 0,
            aqm: AqmState::new(now),
        }
    }

    pub fn checkout_ticket(&self, uid: u64) -> Option<Ticket> {
        self.checkout.get(&uid).copied()
    }

    /// Pop the first idle worker; workers not yet accepting rotate to the back
    fn take_idle(&mut self) -> Option<Arc<WorkerClient>> {
        for _ in 0..self.active.len() {
            let worker = self.active.pop_front()?;
            if worker.state() == WorkerState::Accept {
                return Some(worker);
            }
            self.active.push_back(worker);
        }
        None
    }

    fn current(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s, Slot::Empty))
            .count()
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub desired: usize,
    pub current: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub backlog: usize,
    pub healthy: usize,
}

/// Static knobs of a pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub lifo: bool,
    pub stranded_timeout: Duration,
    pub lifespan_check_interval: Duration,
    pub max_desire_healthy_pct: usize,
    pub dangling_recovery: bool,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lifo: config.pool.lifo_scheduler_enabled,
            stranded_timeout: config.stranded_timeout(),
            lifespan_check_interval: Duration::from_secs(config.pool.lifespan_check_interval_secs.max(1)),
            max_desire_healthy_pct: config.pool.max_desire_healthy_worker_pct,
            dangling_recovery: config.pool.enable_dangling_worker_recovery,
        }
    }
}

/// Shared services a pool is built from
#[derive(Clone)]
pub struct PoolDeps {
    pub tunables: Arc<RuntimeTunables>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub registry: Arc<StateRegistry>,
    pub bind_evict: Arc<BindEvictionTable>,
    pub sink: Arc<dyn EventSink>,
}

/// Workers of one (kind, shard, instance)
pub struct WorkerPool {
    key: PoolKey,
    me: Weak<WorkerPool>,
    settings: PoolSettings,
    tunables: Arc<RuntimeTunables>,
    launcher: Arc<dyn ProcessLauncher>,
    counters: Arc<PoolStateCounters>,
    sink: Arc<dyn EventSink>,
    monitor: PoolMonitor<PoolState>,
    healthy: AtomicUsize,
    aqm: Arc<AdaptiveQueueManager>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(key: PoolKey, size: usize, config: &Config, deps: PoolDeps) -> Arc<Self> {
        let counters = deps.registry.register(key);
        Arc::new_cyclic(|me: &Weak<WorkerPool>| Self {
            key,
            me: me.clone(),
            settings: PoolSettings::from_config(config),
            tunables: deps.tunables.clone(),
            launcher: deps.launcher,
            counters,
            sink: deps.sink.clone(),
            monitor: PoolMonitor::new(PoolState::new(size, Instant::now())),
            healthy: AtomicUsize::new(0),
            aqm: Arc::new(AdaptiveQueueManager::new(
                me.clone(),
                config.backlog.clone(),
                deps.tunables,
                deps.bind_evict,
                deps.sink,
            )),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the initial workers and the background loops
    pub fn start(&self) {
        let ids: Vec<usize> = {
            let mut st = self.monitor.lock();
            let desired = st.desired;
            (0..desired)
                .filter(|&id| {
                    if matches!(st.slots[id], Slot::Empty) {
                        st.slots[id] = Slot::Starting;
                        true
                    } else {
                        false
                    }
                })
                .collect()
        };
        for id in ids {
            self.spawn_slot(id);
        }

        let mut tasks = self.tasks.lock();
        tasks.push(self.aqm.clone().start());
        if let Some(me) = self.me.upgrade() {
            tasks.push(me.start_lifespan_check());
        }
        info!(pool = %self.key, size = self.desired_size(), "worker pool started");
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn aqm(&self) -> &Arc<AdaptiveQueueManager> {
        &self.aqm
    }

    pub fn counters(&self) -> &Arc<PoolStateCounters> {
        &self.counters
    }

    pub fn stranded_timeout(&self) -> Duration {
        self.settings.stranded_timeout
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.monitor.lock()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn desired_size(&self) -> usize {
        self.monitor.lock().desired
    }

    pub fn idle_count(&self) -> usize {
        self.monitor.lock().active.len()
    }

    pub fn backlog(&self) -> usize {
        self.monitor.lock().backlog
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy.load(Ordering::Acquire)
    }

    /// At least a fifth of the desired workers are connected
    pub fn healthy(&self) -> bool {
        let desired = self.desired_size();
        self.healthy_count() * 100 >= desired * HEALTHY_PCT
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.monitor.lock();
        PoolStats {
            desired: st.desired,
            current: st.current(),
            idle: st.active.len(),
            checked_out: st.checkout.len(),
            backlog: st.backlog,
            healthy: self.healthy_count(),
        }
    }

    /// Wait until `n` workers are connected; false on timeout
    pub async fn wait_healthy(&self, n: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while self.healthy_count() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Check out an idle worker, waiting in the backlog if none is free
    ///
    /// `timeout` overrides the adaptive backlog timeout; a zero timeout never
    /// waits.
    pub async fn get_worker(
        &self,
        sql_hash: u32,
        timeout: Option<Duration>,
    ) -> Result<(Arc<WorkerClient>, Ticket), MuxError> {
        loop {
            let (waiter, deadline, long) = {
                let now = Instant::now();
                let mut guard = self.monitor.lock();
                let st = &mut *guard;
                if self.healthy.load(Ordering::Acquire) == 0 {
                    debug!(pool = %self.key, "no healthy worker");
                    return Err(MuxError::RejectDbDown);
                }
                if let Some(worker) = st.take_idle() {
                    return self.dispatch(st, worker);
                }

                let (wait, long) = match timeout {
                    Some(t) => (t, true),
                    None => self.aqm.backlog_timeout(&st.aqm, st.backlog, now),
                };
                if wait.is_zero() {
                    return Err(MuxError::NoWorkerAvailable);
                }
                if self.aqm.should_soft_evict(&mut st.aqm, sql_hash, now) {
                    self.sink.emit(
                        Event::new(EventKind::Eviction, "SOFT_EVICTION")
                            .warning()
                            .with("sqlhash", sql_hash)
                            .with("pool", self.key),
                    );
                    return Err(MuxError::SaturationSoftEviction);
                }
                if st.backlog == 0 {
                    st.aqm.last_empty = now;
                }
                st.backlog += 1;
                (self.monitor.waiter(), now + wait, long)
            };

            let woke = tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), waiter)
                .await
                .is_ok();

            let now = Instant::now();
            let mut guard = self.monitor.lock();
            let st = &mut *guard;
            if !woke {
                self.aqm.reset_if_last_backlog_entry(&mut st.aqm, st.backlog, now);
                st.backlog -= 1;
                drop(guard);
                self.monitor.notify_one();
                debug!(pool = %self.key, long, "backlog wait timed out");
                return Err(if long {
                    MuxError::BacklogTimeout
                } else {
                    MuxError::BacklogEviction
                });
            }
            if let Some(worker) = st.take_idle() {
                self.aqm.reset_if_last_backlog_entry(&mut st.aqm, st.backlog, now);
                st.backlog -= 1;
                return self.dispatch(st, worker);
            }
            st.backlog -= 1;
        }
    }

    fn dispatch(
        &self,
        st: &mut PoolState,
        worker: Arc<WorkerClient>,
    ) -> Result<(Arc<WorkerClient>, Ticket), MuxError> {
        let uid = worker.uid();
        if st.checkout.contains_key(&uid) || st.aqm.dispatched.contains_key(&uid) {
            error!(pool = %self.key, worker = %worker, "worker already checked out");
            self.sink.emit(
                Event::new(EventKind::Worker, "double_dispatch")
                    .error()
                    .with("worker", &*worker),
            );
            return Err(MuxError::DoubleDispatch);
        }

        let ticket = loop {
            let t = Ticket::mint();
            if !st.checkout.values().any(|used| *used == t) {
                break t;
            }
        };
        st.checkout.insert(uid, ticket);
        st.aqm.register(worker.clone(), ticket);
        worker.set_state(WorkerState::Schedule);
        debug!(pool = %self.key, worker = %worker, "worker checked out");
        Ok((worker, ticket))
    }

    /// Give a worker back after a completed request
    ///
    /// Fails with [`MuxError::TicketMismatch`] unless `ticket` is the one
    /// issued at checkout. A worker being recovered is left alone.
    pub fn return_worker(&self, worker: &Arc<WorkerClient>, ticket: Ticket) -> Result<(), MuxError> {
        let now = Instant::now();
        let mut guard = self.monitor.lock();
        let st = &mut *guard;

        let uid = worker.uid();
        match st.checkout.get(&uid) {
            Some(t) if !ticket.is_empty() && *t == ticket => {}
            _ => {
                warn!(pool = %self.key, worker = %worker, "return with wrong ticket");
                self.sink.emit(
                    Event::new(EventKind::Worker, "rtrn_worker_using_wrong_ticket")
                        .warning()
                        .with("worker", &**worker),
                );
                return Err(MuxError::TicketMismatch);
            }
        }

        if worker.state() == WorkerState::Quiesce {
            debug!(pool = %self.key, worker = %worker, "return skipped, worker under recovery");
            return Ok(());
        }

        st.checkout.remove(&uid);
        st.aqm.unregister(uid);
        worker.drain_responses();
        worker.telemetry().clear_sql_start();
        worker.set_state(WorkerState::Accept);

        if worker.id() >= st.desired {
            info!(pool = %self.key, worker = %worker, "retiring worker after downsize");
            drop(guard);
            self.terminate_in_background(worker.clone());
            return Ok(());
        }

        if worker.should_recycle(now) {
            let healthy = self.healthy_count();
            if healthy * 100 >= st.desired * self.settings.max_desire_healthy_pct {
                info!(pool = %self.key, worker = %worker, "recycling worker");
                drop(guard);
                self.terminate_in_background(worker.clone());
                return Ok(());
            }
            debug!(pool = %self.key, worker = %worker, healthy, "recycle deferred, too few healthy workers");
        }

        if self.settings.lifo {
            st.active.push_front(worker.clone());
        } else {
            st.active.push_back(worker.clone());
        }
        drop(guard);
        self.monitor.notify_one();
        Ok(())
    }

    /// Forget a checkout whose worker is being discarded
    pub(crate) fn release_ticket(&self, worker: &WorkerClient, ticket: Ticket) {
        let mut st = self.monitor.lock();
        let uid = worker.uid();
        if st.checkout.get(&uid) == Some(&ticket) {
            st.checkout.remove(&uid);
            st.aqm.unregister(uid);
        }
    }

    /// Change the number of workers
    ///
    /// Growing starts new workers in the background. Shrinking terminates
    /// idle workers beyond the new size at once and busy ones on return.
    pub fn resize(&self, new_size: usize) {
        let (start, stop) = {
            let mut guard = self.monitor.lock();
            let st = &mut *guard;
            let old = st.desired;
            if old == new_size {
                return;
            }
            st.desired = new_size;
            if st.slots.len() < new_size {
                st.slots.resize_with(new_size, || Slot::Empty);
            }

            let mut start = Vec::new();
            let mut stop = Vec::new();
            if new_size > old {
                for id in old..new_size {
                    if matches!(st.slots[id], Slot::Empty) {
                        st.slots[id] = Slot::Starting;
                        start.push(id);
                    }
                }
            } else {
                st.active.retain(|w| {
                    if w.id() >= new_size {
                        stop.push(w.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            info!(pool = %self.key, from = old, to = new_size, "resizing pool");
            (start, stop)
        };

        for id in start {
            self.spawn_slot(id);
        }
        for worker in stop {
            self.terminate_in_background(worker);
        }
    }

    fn terminate_in_background(&self, worker: Arc<WorkerClient>) {
        tokio::spawn(async move {
            worker.terminate().await;
        });
    }

    fn spawn_slot(&self, id: usize) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(me.run_slot(id));
    }

    /// Lifetime of one worker process in slot `id`
    async fn run_slot(self: Arc<Self>, id: usize) {
        let req = SpawnRequest {
            kind: self.key.kind,
            shard_id: self.key.shard_id,
            inst_id: self.key.inst_id,
            id,
        };
        let spec = WorkerSpec {
            id,
            kind: self.key.kind,
            shard_id: self.key.shard_id,
            inst_id: self.key.inst_id,
            max_lifespan: self.tunables.max_lifespan(),
            max_requests: self.tunables.max_requests(),
            stranded_timeout: self.settings.stranded_timeout,
        };

        let process = match self.launcher.spawn(req).await {
            Ok(p) => p,
            Err(e) => {
                warn!(pool = %self.key, id, error = %e, "worker start failed");
                self.sink.emit(
                    Event::new(EventKind::Worker, "spawn_failed")
                        .error()
                        .with("pool", self.key)
                        .with("id", id)
                        .with("error", &e),
                );
                self.restart_after_backoff(id).await;
                return;
            }
        };

        let (worker, mut reader) =
            WorkerClient::new(spec, process, self.counters.clone(), self.sink.clone());
        self.monitor.lock().slots[id] = Slot::Running(worker.clone());

        if let Err(e) = worker.handshake(&mut reader).await {
            warn!(pool = %self.key, worker = %worker, error = %e, "worker handshake failed");
            worker.terminate().await;
            worker.retire();
            self.restart_after_backoff(id).await;
            return;
        }

        let ready = self.worker_ready(&worker);
        worker.read_loop(reader).await;
        self.worker_exited(&worker, ready).await;
    }

    async fn restart_after_backoff(&self, id: usize) {
        tokio::select! {
            _ = tokio::time::sleep(RESTART_BACKOFF) => self.restart_worker(id),
            _ = self.shutdown.cancelled() => {
                self.monitor.lock().slots[id] = Slot::Empty;
            }
        }
    }

    /// Handshake done: the worker joins the idle queue
    fn worker_ready(&self, worker: &Arc<WorkerClient>) -> bool {
        let mut st = self.monitor.lock();
        if self.is_shut_down() || worker.id() >= st.desired {
            drop(st);
            self.terminate_in_background(worker.clone());
            return false;
        }
        worker.set_state(WorkerState::Accept);
        self.healthy.fetch_add(1, Ordering::AcqRel);
        st.active.push_back(worker.clone());
        drop(st);
        self.monitor.notify_one();

        let (inst, uname) = worker.identity();
        info!(pool = %self.key, worker = %worker, pid = ?worker.pid(), inst, db = %uname, "worker ready");
        true
    }

    async fn worker_exited(&self, worker: &Arc<WorkerClient>, was_ready: bool) {
        {
            let mut st = self.monitor.lock();
            if was_ready {
                self.healthy.fetch_sub(1, Ordering::AcqRel);
            }
            let uid = worker.uid();
            st.active.retain(|w| w.uid() != uid);
            st.checkout.remove(&uid);
            st.aqm.unregister(uid);
        }
        worker.terminate().await;
        worker.retire();
        info!(pool = %self.key, worker = %worker, "worker exited");
        self.restart_worker(worker.id());
    }

    /// Start a replacement in slot `id` unless the pool shrank below it
    pub fn restart_worker(&self, id: usize) {
        {
            let mut st = self.monitor.lock();
            if self.is_shut_down() || id >= st.desired {
                if let Some(slot) = st.slots.get_mut(id) {
                    *slot = Slot::Empty;
                }
                return;
            }
            st.slots[id] = Slot::Starting;
        }
        self.spawn_slot(id);
    }

    fn start_lifespan_check(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.lifespan_check_interval) => {}
                    _ = self.shutdown.cancelled() => break,
                }
                self.lifespan_pass(Instant::now());
            }
        })
    }

    /// Recycle idle workers past their lifespan or request budget
    ///
    /// At most a tenth of the pool per pass, and only while enough workers
    /// are healthy. Returns the number recycled.
    pub fn lifespan_pass(&self, now: Instant) -> usize {
        let picked = {
            let mut st = self.monitor.lock();
            let desired = st.desired;
            if self.healthy_count() * 100 < desired * self.settings.max_desire_healthy_pct {
                debug!(pool = %self.key, "lifespan check skipped, pool not healthy enough");
                Vec::new()
            } else {
                let budget = (desired / 10).max(1);
                let mut picked = Vec::new();
                st.active.retain(|w| {
                    if picked.len() < budget && w.should_recycle(now) {
                        picked.push(w.clone());
                        false
                    } else {
                        true
                    }
                });
                picked
            }
        };

        let n = picked.len();
        for worker in picked {
            info!(pool = %self.key, worker = %worker, uptime_s = worker.uptime().as_secs(), "lifespan recycle");
            self.terminate_in_background(worker);
        }

        if self.settings.dangling_recovery {
            self.dangling_pass(now);
        }
        n
    }

    /// Abort checked-out workers whose request has not progressed for three
    /// idle timeouts
    fn dangling_pass(&self, now: Instant) {
        let limit = self.tunables.idle_timeout() * 3;
        let st = self.monitor.lock();
        for d in st.aqm.dispatched.values() {
            let stuck = d
                .worker
                .telemetry()
                .running_for(now)
                .is_some_and(|ran| ran > limit);
            if stuck
                && d.worker.send_control(ControlMsg {
                    abort: true,
                    bind_evict: false,
                })
            {
                warn!(pool = %self.key, worker = %d.worker, "dangling worker aborted");
                self.sink.emit(
                    Event::new(EventKind::Worker, "dangling_worker")
                        .warning()
                        .with("worker", &*d.worker),
                );
            }
        }
    }

    /// Stop background loops and terminate every worker
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let workers: Vec<Arc<WorkerClient>> = {
            let mut st = self.monitor.lock();
            st.active.clear();
            st.slots
                .iter()
                .filter_map(|s| match s {
                    Slot::Running(w) => Some(w.clone()),
                    _ => None,
                })
                .collect()
        };
        for worker in &workers {
            worker.terminate().await;
        }
        info!(pool = %self.key, workers = workers.len(), "worker pool stopped");
    }
}
