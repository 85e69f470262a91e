use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Lifecycle state of one worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Not started, or gone for good
    Unset = 0,
    /// Process spawned, handshake pending
    Init = 1,
    /// Idle in the pool
    Accept = 2,
    /// Request written, no response yet
    Busy = 3,
    /// Response streaming or transaction open
    Wait = 4,
    /// Request completed, not yet returned
    Finish = 5,
    /// Being forcibly reclaimed
    Quiesce = 6,
    /// Checked out, nothing written yet
    Schedule = 7,
}

impl WorkerState {
    pub const COUNT: usize = 8;

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerState::Init,
            2 => WorkerState::Accept,
            3 => WorkerState::Busy,
            4 => WorkerState::Wait,
            5 => WorkerState::Finish,
            6 => WorkerState::Quiesce,
            7 => WorkerState::Schedule,
            _ => WorkerState::Unset,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Unset => "unset",
            WorkerState::Init => "init",
            WorkerState::Accept => "accept",
            WorkerState::Busy => "busy",
            WorkerState::Wait => "wait",
            WorkerState::Finish => "finish",
            WorkerState::Quiesce => "quiesce",
            WorkerState::Schedule => "schedule",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of the pool a worker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    ReadWrite,
    ReadOnly,
    /// Fallback pool used by failover
    Standby,
}

impl WorkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::ReadWrite => "rw",
            WorkerKind::ReadOnly => "ro",
            WorkerKind::Standby => "stdby",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on a process-wide monotonic clock; never 0
pub fn monotonic_ms() -> u64 {
    instant_ms(Instant::now())
}

/// Position of `at` on the [`monotonic_ms`] clock
pub fn instant_ms(at: Instant) -> u64 {
    let origin = *CLOCK_ORIGIN.get_or_init(Instant::now);
    at.saturating_duration_since(origin).as_millis() as u64 + 1
}

/// Lock-free per-worker fields read by recovery logic
#[derive(Debug)]
pub struct WorkerTelemetry {
    state: AtomicU8,
    sql_hash: AtomicU32,
    sql_start_ms: AtomicU64,
    rq_id: AtomicU16,
    req_count: AtomicU64,
    resp_count: AtomicU64,
    under_recovery: AtomicBool,
}

/// Point-in-time copy of [`WorkerTelemetry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub state: WorkerState,
    pub sql_hash: u32,
    pub sql_start_ms: u64,
    pub rq_id: u16,
    pub req_count: u64,
    pub resp_count: u64,
    pub under_recovery: bool,
}

impl Default for WorkerTelemetry {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Init as u8),
            sql_hash: AtomicU32::new(0),
            sql_start_ms: AtomicU64::new(0),
            rq_id: AtomicU16::new(0),
            req_count: AtomicU64::new(0),
            resp_count: AtomicU64::new(0),
            under_recovery: AtomicBool::new(false),
        }
    }
}

impl WorkerTelemetry {
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `new` and return the previous state. A retired worker
    /// (`Unset`) stays retired; `None` is returned in that case.
    pub(crate) fn transition(&self, new: WorkerState) -> Option<WorkerState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != WorkerState::Unset as u8).then_some(new as u8)
            })
            .ok()
            .map(WorkerState::from_u8)
    }

    pub fn sql_hash(&self) -> u32 {
        self.sql_hash.load(Ordering::Relaxed)
    }

    pub fn set_sql_hash(&self, h: u32) {
        self.sql_hash.store(h, Ordering::Relaxed);
    }

    /// 0 when no request is running
    pub fn sql_start_ms(&self) -> u64 {
        self.sql_start_ms.load(Ordering::Relaxed)
    }

    pub fn mark_sql_start(&self) {
        self.sql_start_ms.store(monotonic_ms(), Ordering::Relaxed);
    }

    pub fn clear_sql_start(&self) {
        self.sql_start_ms.store(0, Ordering::Relaxed);
    }

    /// How long the current request has run
    pub fn running_for(&self, now: Instant) -> Option<Duration> {
        let start = self.sql_start_ms();
        if start == 0 {
            return None;
        }
        Some(Duration::from_millis(instant_ms(now).saturating_sub(start)))
    }

    pub fn rq_id(&self) -> u16 {
        self.rq_id.load(Ordering::Acquire)
    }

    /// Advance the request id by `count`, wrapping; returns the new id
    pub(crate) fn advance_rq_id(&self, count: u16) -> u16 {
        self.rq_id
            .fetch_add(count, Ordering::AcqRel)
            .wrapping_add(count)
    }

    pub fn req_count(&self) -> u64 {
        self.req_count.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_req_count(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_resp_count(&self) {
        self.resp_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn under_recovery(&self) -> bool {
        self.under_recovery.load(Ordering::Acquire)
    }

    /// Claim the single recovery slot; false if someone already holds it
    pub(crate) fn begin_recovery(&self) -> bool {
        self.under_recovery
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_recovery(&self) {
        self.under_recovery.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            state: self.state(),
            sql_hash: self.sql_hash(),
            sql_start_ms: self.sql_start_ms(),
            rq_id: self.rq_id(),
            req_count: self.req_count(),
            resp_count: self.resp_count.load(Ordering::Relaxed),
            under_recovery: self.under_recovery(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rq_id_wraps() {
        let t = WorkerTelemetry::default();
        assert_eq!(t.advance_rq_id(u16::MAX), u16::MAX);
        assert_eq!(t.advance_rq_id(2), 1);
        assert_eq!(t.rq_id(), 1);
    }

    #[test]
    fn test_retired_state_is_final() {
        let t = WorkerTelemetry::default();
        assert_eq!(t.transition(WorkerState::Accept), Some(WorkerState::Init));
        assert_eq!(t.transition(WorkerState::Unset), Some(WorkerState::Accept));
        assert_eq!(t.transition(WorkerState::Quiesce), None);
        assert_eq!(t.state(), WorkerState::Unset);
    }

    #[test]
    fn test_recovery_flag_is_single_owner() {
        let t = WorkerTelemetry::default();
        assert!(t.begin_recovery());
        assert!(!t.begin_recovery());
        t.end_recovery();
        assert!(t.begin_recovery());
    }

    #[test]
    fn test_running_for() {
        let t = WorkerTelemetry::default();
        assert!(t.running_for(Instant::now()).is_none());

        t.mark_sql_start();
        let later = Instant::now() + Duration::from_millis(500);
        let ran = t.running_for(later).unwrap();
        assert!(ran >= Duration::from_millis(499));
    }
}
