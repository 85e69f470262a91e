use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use super::taf::fetch_all;
use super::{recover_reason, Coordinator, HeldWorker};
use crate::error::MuxError;
use crate::pool::{PoolKey, WorkerPool};
use crate::protocol::{codes, decode, parse_binds, Frame, InterruptReason};
use crate::taf::ResponseScreen;
use crate::telemetry::{Event, EventKind};
use crate::worker::{WorkerClient, WorkerKind};

/// How worker responses reach the client
pub(super) enum Relay<'a> {
    Direct,
    /// Failover attempt; retryable errors are swallowed
    Screened(ResponseScreen<'a>),
}

impl Relay<'_> {
    fn admit(&mut self, data: &Bytes) -> bool {
        match self {
            Relay::Direct => true,
            Relay::Screened(screen) => {
                let mut buf = BytesMut::from(&data[..]);
                match decode(&mut buf) {
                    Ok(Some(frame)) => screen.admit(&frame),
                    _ => {
                        screen.sent = true;
                        true
                    }
                }
            }
        }
    }

    /// (no retryable error seen, something reached the client)
    pub(super) fn outcome(&self) -> (bool, bool) {
        match self {
            Relay::Direct => (true, true),
            Relay::Screened(screen) => (screen.ok, screen.sent),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> Coordinator<W> {
    fn pool_kind(&self) -> WorkerKind {
        if self.is_read && self.core.config.pool.readonly_children_pct > 0 {
            WorkerKind::ReadOnly
        } else {
            WorkerKind::ReadWrite
        }
    }

    fn select_pool(&self) -> Result<Arc<WorkerPool>, MuxError> {
        self.core.broker.pool(self.pool_kind(), self.shard.shard_id, 0)
    }

    fn checkout_timeout(&self) -> Option<Duration> {
        self.is_internal.then_some(Duration::ZERO)
    }

    /// Refuse requests carrying a throttled bind value
    pub(super) fn bind_throttle_gate(&self, frames: &[Frame]) -> Result<(), MuxError> {
        let table = &self.core.bind_evict;
        if !table.is_throttled(self.sqlhash) {
            return Ok(());
        }

        let kind = self.pool_kind();
        let key = PoolKey::new(kind, self.shard.shard_id, 0);
        let size = self.core.config.pool_size(kind, self.core.tunables.num_workers()) as i64;
        let free = self.core.registry.free_count(&key);
        let thres = (table.settings().target_conn_pct as i64 * size / 100).max(1);
        let heavy = free < thres;
        let recovery_factor = ((free - thres) * 100 / thres).max(0) as f64;

        let binds = parse_binds(frames);
        if let Some(throttle) = table.should_block(self.sqlhash, &binds, heavy, recovery_factor) {
            debug!(session = self.session, sqlhash = self.sqlhash, bind = %throttle.name, "request throttled");
            self.core.sink.emit(
                Event::new(EventKind::Eviction, "BIND_THROTTLE")
                    .warning()
                    .with("sqlhash", self.sqlhash)
                    .with("bind", &throttle.name)
                    .with("value", &throttle.value)
                    .with("allow_every_x", throttle.allow_every_x())
                    .with("free", free),
            );
            return Err(MuxError::BindThrottle);
        }
        Ok(())
    }

    /// Run one request on the held worker or a freshly checked-out one
    pub(super) async fn dispatch_request(&mut self, request: &Frame, frames: &[Frame]) -> Result<(), MuxError> {
        if let Some(held) = self.held.take() {
            let cross_shard = self.core.shard_router.enabled()
                && self.is_read
                && held.worker.shard_id() != self.shard.shard_id;
            if cross_shard {
                let result = self.cross_shard_read(request, frames).await;
                self.held = Some(held);
                return result;
            }
            return self.run_on(held, request).await;
        }

        let pool = self.select_pool()?;
        let (worker, ticket) = pool.get_worker(self.sqlhash, self.checkout_timeout()).await?;
        self.run_on(HeldWorker { worker, pool, ticket }, request).await
    }

    async fn run_on(&mut self, held: HeldWorker, request: &Frame) -> Result<(), MuxError> {
        let mut relay = Relay::Direct;
        let result = self.do_request(&held.worker, request, &mut relay, None).await;
        self.settle(held, result)
    }

    /// Keep, return or recover a worker after a request
    pub(super) fn settle(&mut self, held: HeldWorker, result: Result<bool, MuxError>) -> Result<(), MuxError> {
        match result {
            Ok(true) => {
                self.held = Some(held);
                Ok(())
            }
            Ok(false) => {
                if let Err(e) = held.pool.return_worker(&held.worker, held.ticket) {
                    warn!(session = self.session, worker = %held.worker, error = %e, "worker return failed");
                }
                Ok(())
            }
            Err(MuxError::WorkerFail) => {
                held.pool.release_ticket(&held.worker, held.ticket);
                Err(MuxError::WorkerFail)
            }
            Err(e) => {
                held.recover_in_background(recover_reason(&e));
                Err(e)
            }
        }
    }

    /// Read from another shard while a transaction pins a worker; the
    /// session stays on the transaction's shard afterwards
    async fn cross_shard_read(&mut self, request: &Frame, frames: &[Frame]) -> Result<(), MuxError> {
        self.core.sink.emit(
            Event::new(EventKind::Sharding, "cross_shard_request")
                .with("sql", self.sqlhash)
                .with("shard", self.shard.shard_id),
        );
        let result = self.cross_shard_attempt(request, frames).await;
        self.shard = self.prev_shard.clone();
        self.in_txn = true;
        result
    }

    async fn cross_shard_attempt(&mut self, request: &Frame, frames: &[Frame]) -> Result<(), MuxError> {
        // the extra worker is given up afterwards, so no cursor may stay open
        let request = fetch_all(request, frames);
        let pool = self.select_pool()?;
        let (worker, ticket) = pool.get_worker(self.sqlhash, self.checkout_timeout()).await?;
        let held = HeldWorker { worker, pool, ticket };

        let prepend = std::mem::replace(&mut self.prepend_corr_id, true);
        let mut relay = Relay::Direct;
        let outcome = self.do_request(&held.worker, &request, &mut relay, None).await;
        self.prepend_corr_id = prepend;

        if let Ok(true) = outcome {
            // only the transaction's worker may stay checked out
            held.recover_in_background(InterruptReason::Switch);
            return Ok(());
        }
        self.settle(held, outcome)
    }

    /// Forward `request` to `worker` and relay the response
    ///
    /// Returns whether the worker must be kept, i.e. the request ended with
    /// a transaction or cursor still open.
    pub(super) async fn do_request(
        &mut self,
        worker: &Arc<WorkerClient>,
        request: &Frame,
        relay: &mut Relay<'_>,
        deadline: Option<Duration>,
    ) -> Result<bool, MuxError> {
        worker.telemetry().mark_sql_start();
        let frames = request
            .sub_frames()
            .map_err(|e| MuxError::RequestParse(e.to_string()))?;

        let outbound = if self.prepend_corr_id {
            let corr = self
                .corr_id
                .clone()
                .unwrap_or_else(|| Frame::new(codes::CORRELATION_ID, "CorrId=NotSet"));
            let mut parts = Vec::with_capacity(frames.len() + 1);
            parts.push(corr);
            parts.extend(frames.iter().cloned());
            Frame::composite(&parts)
        } else {
            request.clone()
        };

        worker.write(&outbound).await?;
        if frames.iter().any(|f| f.cmd == codes::COMMIT || f.cmd == codes::ROLLBACK) {
            worker.telemetry().clear_sql_start();
        }
        worker.set_request_info(self.sqlhash, parse_binds(&frames));
        worker.telemetry().incr_req_count();

        let far = tokio::time::Instant::now() + Duration::from_secs(86_400 * 365);
        let timeout_at = deadline.map(|d| tokio::time::Instant::now() + d);
        let mut timeout_armed = timeout_at.is_some();
        let txn_idle = self.transaction_idle_timeout();
        let shutdown = self.core.shutdown.clone();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(timeout_at.unwrap_or(far)), if timeout_armed => {
                    debug!(session = self.session, worker = %worker, "request deadline passed");
                    return Err(MuxError::Timeout);
                }
                _ = tokio::time::sleep(txn_idle) => {
                    return Err(MuxError::Timeout);
                }
                frame = self.client_rx.recv() => {
                    let Some(frame) = frame else {
                        return Err(MuxError::ClientFail);
                    };
                    if !matches!(frame.cmd, codes::FETCH | codes::COLS | codes::COLS_INFO) {
                        self.core.sink.emit(
                            Event::new(EventKind::Mux, "multiple_client_req")
                                .warning()
                                .with("cmd", frame.cmd)
                                .with("sql", self.sqlhash),
                        );
                    }
                    worker.write(&frame).await?;
                    timeout_armed = false;
                }
                _ = shutdown.cancelled() => {
                    return Err(MuxError::Canceled);
                }
                msg = worker.recv_response() => {
                    let Some(msg) = msg else {
                        return Err(MuxError::WorkerFail);
                    };
                    if msg.free && msg.rq_id.is_some_and(|id| id != worker.telemetry().rq_id()) {
                        self.emit_stale_eor(worker, msg.rq_id);
                        continue;
                    }
                    if !msg.data.is_empty() && relay.admit(&msg.data) {
                        self.write_raw(&msg.data).await?;
                        timeout_armed = false;
                    }
                    if msg.free {
                        worker.telemetry().clear_sql_start();
                        self.in_txn = false;
                        return Ok(false);
                    }
                    if msg.eor {
                        if !self.is_read {
                            self.in_txn = msg.in_transaction;
                        }
                        return Ok(true);
                    }
                }
                ctrl = worker.recv_control() => {
                    if let Some(ctrl) = ctrl {
                        if ctrl.abort {
                            return Err(if ctrl.bind_evict {
                                MuxError::BindEviction
                            } else {
                                MuxError::SaturationKill
                            });
                        }
                    }
                }
            }
        }
    }
}
