//! Per-connection coordinator
//!
//! A coordinator owns one client session. It answers mux-level commands
//! itself, routes statements to a shard, checks a worker out of the right
//! pool, relays the worker's response and gives the worker back, or keeps it
//! while a transaction or cursor stays open.

mod dispatch;
mod taf;

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::Core;
use crate::error::MuxError;
use crate::pool::{Ticket, WorkerPool};
use crate::protocol::{codes, sql_hash, write_frame, Frame, InterruptReason};
use crate::shard::ShardContext;
use crate::telemetry::{Event, EventKind};
use crate::worker::{ControlMsg, WorkerClient, WorkerMsg};

/// Client info marking sessions opened by the multiplexer's own tooling
pub const INTERNAL_CLIENT_MARKER: &str = "dbmux-internal";

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// What the session loop does after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Close,
}

/// A worker kept across requests
struct HeldWorker {
    worker: Arc<WorkerClient>,
    pool: Arc<WorkerPool>,
    ticket: Ticket,
}

impl HeldWorker {
    fn recover_in_background(self, reason: InterruptReason) {
        tokio::spawn(self.worker.recover(self.pool, self.ticket, reason));
    }
}

/// Drives one client session until it ends
pub struct Coordinator<W> {
    core: Core,
    session: u64,
    client_rx: mpsc::Receiver<Frame>,
    out: W,
    corr_id: Option<Frame>,
    shard: ShardContext,
    prev_shard: ShardContext,
    held: Option<HeldWorker>,
    in_txn: bool,
    is_read: bool,
    is_internal: bool,
    sqlhash: u32,
    prepend_corr_id: bool,
}

async fn next_response(worker: Option<Arc<WorkerClient>>) -> Option<WorkerMsg> {
    match worker {
        Some(w) => w.recv_response().await,
        None => std::future::pending().await,
    }
}

async fn next_control(worker: Option<Arc<WorkerClient>>) -> ControlMsg {
    match worker {
        Some(w) => match w.recv_control().await {
            Some(msg) => msg,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

impl<W: AsyncWrite + Unpin + Send> Coordinator<W> {
    /// `client_rx` yields decoded client frames and closes when the client
    /// goes away; responses are written to `out`.
    pub fn new(core: Core, client_rx: mpsc::Receiver<Frame>, out: W) -> Self {
        Self {
            core,
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            client_rx,
            out,
            corr_id: None,
            shard: ShardContext::default(),
            prev_shard: ShardContext::default(),
            held: None,
            in_txn: false,
            is_read: false,
            is_internal: false,
            sqlhash: 0,
            prepend_corr_id: false,
        }
    }

    pub async fn run(mut self) {
        debug!(session = self.session, "session started");
        loop {
            let idle = if self.held.is_some() {
                self.core.tunables.transaction_idle_timeout()
            } else {
                self.core.tunables.idle_timeout()
            };
            let worker = self.held.as_ref().map(|h| h.worker.clone());
            let shutdown = self.core.shutdown.clone();

            let step = tokio::select! {
                frame = self.client_rx.recv() => match frame {
                    Some(frame) => self.handle_mux(frame).await,
                    None => {
                        debug!(session = self.session, "client closed");
                        Step::Close
                    }
                },
                _ = tokio::time::sleep(idle) => {
                    info!(session = self.session, idle_ms = idle.as_millis() as u64, "idle timeout");
                    Step::Close
                }
                msg = next_response(worker.clone()) => self.handle_unsolicited(msg).await,
                ctrl = next_control(worker) => self.handle_abort(ctrl).await,
                _ = shutdown.cancelled() => Step::Close,
            };
            if step == Step::Close {
                break;
            }
        }

        if let Some(held) = self.held.take() {
            held.recover_in_background(InterruptReason::ClientGone);
        }
        let _ = self.out.shutdown().await;
        debug!(session = self.session, "session ended");
    }

    /// Response from a held worker outside of a request
    async fn handle_unsolicited(&mut self, msg: Option<WorkerMsg>) -> Step {
        let Some(msg) = msg else {
            warn!(session = self.session, "held worker went away");
            if let Some(held) = self.held.take() {
                held.pool.release_ticket(&held.worker, held.ticket);
            }
            return Step::Close;
        };
        let Some(held) = self.held.as_ref() else {
            return Step::Continue;
        };
        if msg.free && msg.rq_id.is_some_and(|id| id != held.worker.telemetry().rq_id()) {
            self.emit_stale_eor(&held.worker, msg.rq_id);
            return Step::Continue;
        }
        if !msg.data.is_empty() && self.write_raw(&msg.data).await.is_err() {
            return Step::Close;
        }
        if msg.eor && !self.is_read {
            self.in_txn = msg.in_transaction;
        }
        if msg.free {
            self.in_txn = false;
            if let Some(held) = self.held.take() {
                if let Err(e) = held.pool.return_worker(&held.worker, held.ticket) {
                    warn!(session = self.session, error = %e, "returning held worker failed");
                }
            }
        }
        Step::Continue
    }

    /// Abort signalled for the held worker by saturation recovery or bind
    /// eviction
    async fn handle_abort(&mut self, ctrl: ControlMsg) -> Step {
        if !ctrl.abort {
            return Step::Continue;
        }
        let error = if ctrl.bind_evict {
            MuxError::BindEviction
        } else {
            MuxError::SaturationKill
        };
        if let Some(held) = self.held.take() {
            held.recover_in_background(InterruptReason::Saturation);
        }
        let _ = self.write_error(&error).await;
        Step::Close
    }

    async fn handle_mux(&mut self, frame: Frame) -> Step {
        self.is_read = false;
        self.prepend_corr_id = self.held.is_none();

        let frames = match frame.sub_frames() {
            Ok(frames) => frames,
            Err(e) => {
                warn!(session = self.session, error = %e, "malformed composite request");
                let _ = self.write_error(&MuxError::RequestParse(e.to_string())).await;
                return Step::Close;
            }
        };

        if let Some(prepare) = frames.iter().find(|f| codes::is_prepare(f.cmd)) {
            let sql = prepare.payload_str();
            self.sqlhash = sql_hash(&sql);
            self.is_read = self.core.classifier.is_read(&sql);

            if !self.in_txn {
                if let Some(held) = self.held.take() {
                    debug!(session = self.session, worker = %held.worker, "new statement, releasing held worker");
                    held.recover_in_background(InterruptReason::Switch);
                    self.prepend_corr_id = true;
                }
            }

            if self.core.shard_router.enabled() {
                let router = self.core.shard_router.clone();
                let routed = router.preprocess(
                    &mut self.shard,
                    &mut self.prev_shard,
                    &frames,
                    self.sqlhash,
                    self.is_read,
                    self.in_txn,
                );
                if let Err(rejection) = routed {
                    debug!(session = self.session, error = %rejection.error, hangup = rejection.hangup, "statement rejected by shard router");
                    if self.write_error(&rejection.error).await.is_err() || rejection.hangup {
                        return Step::Close;
                    }
                    return Step::Continue;
                }
            }
            return self.dispatch(&frame, &frames).await;
        }

        if !frame.is_composite() {
            if let Some(step) = self.handle_command(&frame).await {
                return step;
            }
        }
        self.dispatch(&frame, &frames).await
    }

    /// Commands answered without a worker; `None` when the frame must go to
    /// a worker
    async fn handle_command(&mut self, frame: &Frame) -> Option<Step> {
        let reply = match frame.cmd {
            codes::CORRELATION_ID => {
                self.corr_id = Some(frame.clone());
                return Some(Step::Continue);
            }
            codes::SERVER_PING => Frame::empty(codes::SERVER_ALIVE),
            codes::CLIENT_INFO => {
                let info = frame.payload_str();
                if info.contains(INTERNAL_CLIENT_MARKER) {
                    self.is_internal = true;
                }
                debug!(session = self.session, client = %info, "client info");
                Frame::new(codes::RC_OK, server_info())
            }
            codes::COMMIT | codes::ROLLBACK if self.held.is_none() => {
                self.in_txn = false;
                Frame::empty(codes::RC_OK)
            }
            codes::FETCH if self.held.is_none() => Frame::new(
                codes::RC_ERROR,
                "fetch requested but no statement exists",
            ),
            codes::SET_SHARD_ID => {
                let worker_shard = if self.in_txn {
                    self.held.as_ref().map(|h| h.worker.shard_id())
                } else {
                    None
                };
                let router = self.core.shard_router.clone();
                let payload = frame.payload_str().into_owned();
                return Some(match router.set_shard_id(&mut self.shard, &payload, worker_shard) {
                    Ok(()) => self.reply(&Frame::empty(codes::RC_OK)).await,
                    Err(e) => {
                        let _ = self.write_error(&e).await;
                        Step::Close
                    }
                });
            }
            codes::GET_NUM_SHARDS => Frame::new(
                codes::RC_OK,
                self.core.shard_router.num_shards().to_string(),
            ),
            _ => return None,
        };
        Some(self.reply(&reply).await)
    }

    async fn dispatch(&mut self, request: &Frame, frames: &[Frame]) -> Step {
        if let Err(e) = self.bind_throttle_gate(frames) {
            return self.process_error(e).await;
        }
        let result = if self.core.taf.enabled() && self.held.is_none() {
            self.dispatch_taf_session(request, frames).await
        } else {
            self.dispatch_request(request, frames).await
        };
        match result {
            Ok(()) => Step::Continue,
            Err(e) => self.process_error(e).await,
        }
    }

    /// Report a failed dispatch; admission failures keep the session open
    async fn process_error(&mut self, error: MuxError) -> Step {
        debug!(session = self.session, sqlhash = self.sqlhash, error = %error, "request failed");
        if error.code().is_some() && self.write_error(&error).await.is_err() {
            return Step::Close;
        }
        if error.is_admission() {
            Step::Continue
        } else {
            Step::Close
        }
    }

    async fn reply(&mut self, frame: &Frame) -> Step {
        match write_frame(&mut self.out, frame).await {
            Ok(()) => Step::Continue,
            Err(_) => Step::Close,
        }
    }

    async fn write_error(&mut self, error: &MuxError) -> Result<(), MuxError> {
        let frame = error.to_frame(&self.core.config.server.error_code_prefix);
        write_frame(&mut self.out, &frame)
            .await
            .map_err(|_| MuxError::ClientFail)
    }

    async fn write_raw(&mut self, data: &Bytes) -> Result<(), MuxError> {
        self.out.write_all(data).await.map_err(|_| MuxError::ClientFail)?;
        self.out.flush().await.map_err(|_| MuxError::ClientFail)
    }

    fn emit_stale_eor(&self, worker: &WorkerClient, rq_id: Option<u16>) {
        self.core.sink.emit(
            Event::new(EventKind::Mux, "stale_eor")
                .warning()
                .with("worker", worker)
                .with("rq_id", rq_id.unwrap_or_default())
                .with("expected", worker.telemetry().rq_id()),
        );
    }

    fn transaction_idle_timeout(&self) -> Duration {
        self.core.tunables.transaction_idle_timeout()
    }
}

fn server_info() -> String {
    format!(
        "{} {} pid={}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    )
}

fn recover_reason(error: &MuxError) -> InterruptReason {
    match error {
        MuxError::SaturationKill | MuxError::BindEviction => InterruptReason::Saturation,
        MuxError::Timeout => InterruptReason::Timeout,
        MuxError::ClientFail => InterruptReason::ClientGone,
        _ => InterruptReason::Switch,
    }
}
