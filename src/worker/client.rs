use bytes::{Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::process::{BoxReader, BoxWriter, ProcessHandle, WorkerProcess};
use super::state::{TelemetrySnapshot, WorkerKind, WorkerState, WorkerTelemetry};
use crate::error::MuxError;
use crate::pool::{PoolStateCounters, Ticket, WorkerPool};
use crate::protocol::{codes, write_frame, BindPair, EorCode, Frame, FrameReader, InterruptReason};
use crate::telemetry::{Event, EventKind, EventSink};

/// Capacity of the worker to coordinator response queue
const RESPONSE_QUEUE: usize = 30;

/// Capacity of the abort signal queue
const CONTROL_QUEUE: usize = 5;

/// Poll interval while waiting for a terminated process to exit
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and kill
const EXIT_GRACE: Duration = Duration::from_millis(2000);

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Response relayed from the worker's read loop
#[derive(Debug, Clone, Default)]
pub struct WorkerMsg {
    /// Serialized frames for the client
    pub data: Bytes,

    /// End of request reached
    pub eor: bool,

    /// Worker is free for another session
    pub free: bool,

    /// A transaction or cursor stays open
    pub in_transaction: bool,

    /// Request id echoed by the worker
    pub rq_id: Option<u16>,
}

/// Out-of-band instruction to the coordinator holding a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMsg {
    pub abort: bool,
    pub bind_evict: bool,
}

/// Identity of a worker and the knobs it was started with
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: usize,
    pub kind: WorkerKind,
    pub shard_id: usize,
    pub inst_id: usize,
    pub max_lifespan: Duration,
    pub max_requests: u64,
    pub stranded_timeout: Duration,
}

/// Handle to one worker process
///
/// Owns the write side of the worker's data and control streams and the
/// receiving end of the queue fed by its read loop. Only the coordinator
/// holding the matching [`Ticket`] talks to it; everyone else may only ask
/// for recovery.
pub struct WorkerClient {
    uid: u64,
    spec: WorkerSpec,
    telemetry: WorkerTelemetry,
    counters: Arc<PoolStateCounters>,
    sink: Arc<dyn EventSink>,
    process: Box<dyn ProcessHandle>,
    data_writer: Mutex<Option<BoxWriter>>,
    ctrl_writer: Mutex<Option<BoxWriter>>,
    responses: Mutex<mpsc::Receiver<WorkerMsg>>,
    response_tx: SyncMutex<Option<mpsc::Sender<WorkerMsg>>>,
    control_tx: mpsc::Sender<ControlMsg>,
    control_rx: Mutex<mpsc::Receiver<ControlMsg>>,
    started_at: Instant,
    exit_at: Option<Instant>,
    max_requests: u64,
    binds: SyncMutex<Vec<BindPair>>,
    identity: SyncMutex<(i32, String)>,
}

impl fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerClient")
            .field("uid", &self.uid)
            .field("id", &self.spec.id)
            .field("kind", &self.spec.kind)
            .field("shard", &self.spec.shard_id)
            .field("pid", &self.process.pid())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for WorkerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}#{}",
            self.spec.kind, self.spec.shard_id, self.spec.inst_id, self.spec.id
        )
    }
}

impl WorkerClient {
    /// Wrap a freshly spawned process; returns the client and the reader the
    /// read loop consumes.
    pub fn new(
        spec: WorkerSpec,
        process: WorkerProcess,
        counters: Arc<PoolStateCounters>,
        sink: Arc<dyn EventSink>,
    ) -> (Arc<Self>, FrameReader<BoxReader>) {
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let started_at = Instant::now();

        let mut rng = rand::thread_rng();
        let exit_at = if spec.max_lifespan.is_zero() {
            None
        } else {
            let secs = spec.max_lifespan.as_secs();
            let jitter = if secs >= 4 { rng.gen_range(0..secs / 4) } else { 0 };
            Some(started_at + spec.max_lifespan - Duration::from_secs(jitter))
        };
        let max_requests = if spec.max_requests >= 4 {
            spec.max_requests - rng.gen_range(0..spec.max_requests / 4)
        } else {
            spec.max_requests
        };

        counters.enter(WorkerState::Init);
        let WorkerProcess { io, handle } = process;
        let client = Arc::new(Self {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            spec,
            telemetry: WorkerTelemetry::default(),
            counters,
            sink,
            process: handle,
            data_writer: Mutex::new(Some(io.data_writer)),
            ctrl_writer: Mutex::new(Some(io.ctrl_writer)),
            responses: Mutex::new(response_rx),
            response_tx: SyncMutex::new(Some(response_tx)),
            control_tx,
            control_rx: Mutex::new(control_rx),
            started_at,
            exit_at,
            max_requests,
            binds: SyncMutex::new(Vec::new()),
            identity: SyncMutex::new((0, String::new())),
        });
        (client, FrameReader::new(io.data_reader))
    }

    /// Unique across all workers ever started in this process
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn id(&self) -> usize {
        self.spec.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.spec.kind
    }

    pub fn shard_id(&self) -> usize {
        self.spec.shard_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn state(&self) -> WorkerState {
        self.telemetry.state()
    }

    pub fn telemetry(&self) -> &WorkerTelemetry {
        &self.telemetry
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Instance id and database session reported at handshake
    pub fn identity(&self) -> (i32, String) {
        self.identity.lock().clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The only state mutator; keeps the pool's state counters in step
    pub(crate) fn set_state(&self, new: WorkerState) {
        if let Some(old) = self.telemetry.transition(new) {
            if old != new {
                self.counters.transition(old, new);
            }
        }
    }

    pub fn lifespan_expired(&self, now: Instant) -> bool {
        self.exit_at.is_some_and(|at| now >= at)
    }

    pub fn request_limit_reached(&self) -> bool {
        self.max_requests > 0 && self.telemetry.req_count() >= self.max_requests
    }

    pub fn should_recycle(&self, now: Instant) -> bool {
        self.lifespan_expired(now) || self.request_limit_reached()
    }

    pub fn binds(&self) -> Vec<BindPair> {
        self.binds.lock().clone()
    }

    pub fn set_request_info(&self, sql_hash: u32, binds: Vec<BindPair>) {
        self.telemetry.set_sql_hash(sql_hash);
        *self.binds.lock() = binds;
    }

    /// Consume the one-time handshake: a control frame "<instance> <db session>"
    pub(crate) async fn handshake(&self, reader: &mut FrameReader<BoxReader>) -> Result<(), MuxError> {
        let frame = reader
            .next_frame()
            .await
            .map_err(|e| MuxError::Transport(e.to_string()))?
            .ok_or_else(|| MuxError::Transport("worker closed before handshake".to_string()))?;
        if frame.cmd != codes::CONTROL_MSG {
            return Err(MuxError::Transport(format!(
                "expected handshake control frame, got cmd {}",
                frame.cmd
            )));
        }

        let text = frame.payload_str();
        let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
        let inst = digits.parse::<i32>().unwrap_or(0);
        let uname = text[digits.len()..].trim().to_string();
        debug!(worker = %self, pid = ?self.pid(), inst, uname = %uname, "worker handshake");
        *self.identity.lock() = (inst, uname);
        Ok(())
    }

    /// Forward a request. `frame.request_count()` advances the request id.
    pub async fn write(&self, frame: &Frame) -> Result<(), MuxError> {
        self.set_state(WorkerState::Busy);
        let rq_id = self.telemetry.advance_rq_id(frame.request_count());

        let mut guard = self.data_writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(MuxError::Transport(
                "writing to a closed worker connection".to_string(),
            ));
        };
        if let Err(e) = write_frame(writer, frame).await {
            warn!(worker = %self, pid = ?self.pid(), error = %e, "worker write failed");
            guard.take();
            drop(guard);
            self.process.terminate();
            return Err(MuxError::WorkerFail);
        }
        debug!(worker = %self, rq_id, cmd = frame.cmd, "request sent to worker");
        Ok(())
    }

    /// Next response from the read loop; `None` once the loop has ended
    pub async fn recv_response(&self) -> Option<WorkerMsg> {
        self.responses.lock().await.recv().await
    }

    /// Next abort signal; pends forever while none is queued
    pub async fn recv_control(&self) -> Option<ControlMsg> {
        self.control_rx.lock().await.recv().await
    }

    /// Queue an abort for the holder; fails if the queue is full
    pub fn send_control(&self, msg: ControlMsg) -> bool {
        self.control_tx.try_send(msg).is_ok()
    }

    /// Drop leftover responses and signals from a previous checkout
    pub(crate) fn drain_responses(&self) {
        if let Ok(mut rx) = self.responses.try_lock() {
            let mut n = 0;
            while rx.try_recv().is_ok() {
                n += 1;
            }
            if n > 0 {
                debug!(worker = %self, dropped = n, "drained late worker responses");
            }
        }
        if let Ok(mut rx) = self.control_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }

    /// Decode worker frames into [`WorkerMsg`]s until the stream ends or the
    /// worker sends a control frame. Dropping the sender closes the queue.
    pub(crate) async fn read_loop(&self, mut reader: FrameReader<BoxReader>) {
        let Some(tx) = self.response_tx.lock().take() else {
            return;
        };
        let mut pending = BytesMut::new();

        loop {
            let frame = match reader.next_frame().await {
                Ok(Some(f)) => f,
                Ok(None) => {
                    debug!(worker = %self, pid = ?self.pid(), "worker stream closed");
                    break;
                }
                Err(e) => {
                    warn!(worker = %self, pid = ?self.pid(), error = %e, "worker read error");
                    break;
                }
            };
            self.telemetry.incr_resp_count();

            match frame.cmd {
                codes::EOR => {
                    let Some((code, rq_id, data)) = frame.parse_eor() else {
                        warn!(worker = %self, "malformed end of request");
                        break;
                    };
                    pending.extend_from_slice(&data);

                    let current = rq_id.map_or(true, |id| id == self.telemetry.rq_id());
                    if code == EorCode::Free {
                        if current {
                            self.set_state(WorkerState::Finish);
                        }
                    } else {
                        self.set_state(WorkerState::Wait);
                    }

                    if code == EorCode::MoreIncoming {
                        continue;
                    }
                    let msg = WorkerMsg {
                        data: pending.split().freeze(),
                        eor: true,
                        free: code == EorCode::Free,
                        in_transaction: code.in_transaction(),
                        rq_id,
                    };
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                codes::CONTROL_MSG => {
                    debug!(worker = %self, payload = %frame.payload_str(), "worker control message");
                    break;
                }
                cmd => {
                    if cmd != codes::RC_STILL_EXECUTING {
                        self.set_state(WorkerState::Wait);
                    }
                    if !pending.is_empty() {
                        let flushed = WorkerMsg {
                            data: pending.split().freeze(),
                            ..Default::default()
                        };
                        if tx.send(flushed).await.is_err() {
                            break;
                        }
                    }
                    let msg = WorkerMsg {
                        data: frame.to_bytes(),
                        ..Default::default()
                    };
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }

        if !pending.is_empty() {
            let _ = tx
                .send(WorkerMsg {
                    data: pending.freeze(),
                    ..Default::default()
                })
                .await;
        }
    }

    async fn send_interrupt(&self, reason: InterruptReason, rq_id: u16) -> Result<(), MuxError> {
        let mut guard = self.ctrl_writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| MuxError::Transport("control stream closed".to_string()))?;
        write_frame(writer, &Frame::interrupt(reason, rq_id))
            .await
            .map_err(|e| MuxError::Transport(e.to_string()))
    }

    /// Forcibly reclaim a checked-out worker
    ///
    /// Interrupts the current request and waits for the matching free
    /// end-of-request. On success the worker goes back to `pool`; otherwise
    /// the process is terminated and the pool restarts it. Never fails
    /// outward and only one recovery runs at a time.
    pub async fn recover(self: Arc<Self>, pool: Arc<WorkerPool>, ticket: Ticket, reason: InterruptReason) {
        if !self.telemetry.begin_recovery() {
            debug!(worker = %self, "recovery already in progress");
            return;
        }
        let outcome = self.recover_inner(&pool, reason).await;
        self.telemetry.end_recovery();

        match outcome {
            RecoverOutcome::Freed => match pool.return_worker(&self, ticket) {
                Ok(()) => {
                    info!(worker = %self, reason = reason.as_str(), "worker recovered");
                    self.sink.emit(
                        Event::new(EventKind::Worker, "RECOVERED")
                            .with("worker", &*self)
                            .with("reason", reason.as_str()),
                    );
                }
                Err(e) => {
                    warn!(worker = %self, error = %e, "recovered worker could not be returned");
                }
            },
            RecoverOutcome::AlreadyIdle | RecoverOutcome::Skipped => {}
            RecoverOutcome::Recycled => {
                self.sink.emit(
                    Event::new(EventKind::Worker, "RECYCLED")
                        .warning()
                        .with("worker", &*self)
                        .with("pid", self.pid().unwrap_or(0))
                        .with("reason", reason.as_str()),
                );
                pool.release_ticket(&self, ticket);
                self.terminate().await;
            }
            RecoverOutcome::Exited => {
                self.sink.emit(
                    Event::new(EventKind::Worker, "EXITED")
                        .warning()
                        .with("worker", &*self)
                        .with("reason", reason.as_str()),
                );
                pool.release_ticket(&self, ticket);
            }
        }
    }

    async fn recover_inner(&self, pool: &WorkerPool, reason: InterruptReason) -> RecoverOutcome {
        match self.state() {
            WorkerState::Wait | WorkerState::Busy | WorkerState::Schedule => {}
            WorkerState::Accept => return RecoverOutcome::AlreadyIdle,
            WorkerState::Unset => return RecoverOutcome::Exited,
            other => {
                debug!(worker = %self, state = ?other, "not recoverable from this state");
                return RecoverOutcome::Skipped;
            }
        }
        self.set_state(WorkerState::Quiesce);

        let rq_id = self.telemetry.rq_id();
        debug!(worker = %self, rq_id, reason = reason.as_str(), pool = %pool.key(), "interrupting worker");
        if let Err(e) = self.send_interrupt(reason, rq_id).await {
            warn!(worker = %self, error = %e, "interrupt not delivered");
            return RecoverOutcome::Recycled;
        }

        let deadline = tokio::time::Instant::now() + self.spec.stranded_timeout;
        let Ok(mut responses) = tokio::time::timeout_at(deadline, self.responses.lock()).await else {
            return RecoverOutcome::Recycled;
        };
        loop {
            match tokio::time::timeout_at(deadline, responses.recv()).await {
                Err(_) => {
                    warn!(worker = %self, rq_id, "worker did not free itself in time");
                    return RecoverOutcome::Recycled;
                }
                Ok(None) => return RecoverOutcome::Exited,
                Ok(Some(msg)) => {
                    if msg.free && msg.rq_id.map_or(true, |id| id == rq_id) {
                        self.set_state(WorkerState::Finish);
                        return RecoverOutcome::Freed;
                    }
                    debug!(worker = %self, eor = msg.eor, len = msg.data.len(), "discarding response during recovery");
                }
            }
        }
    }

    /// SIGTERM, wait up to the grace period, then kill. Closes both streams.
    pub async fn terminate(&self) {
        if let Some(mut w) = self.ctrl_writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        if let Some(mut w) = self.data_writer.lock().await.take() {
            let _ = w.shutdown().await;
        }

        if !self.process.has_exited() {
            self.process.terminate();
            let deadline = Instant::now() + EXIT_GRACE;
            while !self.process.has_exited() && Instant::now() < deadline {
                tokio::time::sleep(EXIT_POLL).await;
            }
            if !self.process.has_exited() {
                warn!(worker = %self, pid = ?self.pid(), "worker ignored SIGTERM, killing");
                self.process.kill();
            }
        }
        self.drain_responses();
    }

    /// Leave the state counters once the process is gone for good
    pub(crate) fn retire(&self) {
        self.set_state(WorkerState::Unset);
    }
}

enum RecoverOutcome {
    Freed,
    AlreadyIdle,
    Skipped,
    Recycled,
    Exited,
}
