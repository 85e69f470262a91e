use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use super::dispatch::Relay;
use super::{Coordinator, HeldWorker};
use crate::error::MuxError;
use crate::protocol::{codes, Frame, InterruptReason};
use crate::telemetry::{Event, EventKind};
use crate::worker::WorkerKind;

/// Deadline on the primary for statements known to be slow there
const SLOW_QUERY_DEADLINE: Duration = Duration::from_secs(3600);

/// Ask for every row at once, so nothing is left behind in an open cursor
pub(super) fn fetch_all(request: &Frame, frames: &[Frame]) -> Frame {
    if !frames.iter().any(|f| f.cmd == codes::FETCH) {
        return request.clone();
    }
    let rewritten: Vec<Frame> = frames
        .iter()
        .map(|f| {
            if f.cmd == codes::FETCH {
                Frame::new(codes::FETCH, "0")
            } else {
                f.clone()
            }
        })
        .collect();
    if request.is_composite() {
        Frame::composite(&rewritten)
    } else {
        rewritten.into_iter().next().unwrap_or_else(|| request.clone())
    }
}

impl<W: AsyncWrite + Unpin + Send> Coordinator<W> {
    /// Try the primary with a short deadline, then fall back to the standby
    /// pool of the same shard
    pub(super) async fn dispatch_taf_session(&mut self, request: &Frame, frames: &[Frame]) -> Result<(), MuxError> {
        let shard_id = self.shard.shard_id;
        let standby = self.core.broker.pool(WorkerKind::Standby, shard_id, 0)?;
        if !standby.healthy() {
            return self.dispatch_request(request, frames).await;
        }

        let request = fetch_all(request, frames);
        let taf = self.core.taf.clone();
        let primary = self.core.broker.pool(WorkerKind::ReadWrite, shard_id, 0)?;

        if taf.shard(shard_id).use_primary() && primary.healthy() {
            if let Ok((worker, ticket)) = primary.get_worker(self.sqlhash, Some(Duration::ZERO)).await {
                let deadline = if self.is_internal || taf.queries(shard_id).is_normally_slow(self.sqlhash) {
                    SLOW_QUERY_DEADLINE
                } else {
                    taf.timeout()
                };
                let mut relay = Relay::Screened(taf.screen());
                let result = self.do_request(&worker, &request, &mut relay, Some(deadline)).await;
                let (ok, sent) = relay.outcome();
                let held = HeldWorker {
                    worker,
                    pool: primary,
                    ticket,
                };
                let shard_taf = taf.shard(shard_id);

                match result {
                    Ok(true) => {
                        held.recover_in_background(InterruptReason::Failover);
                        return Err(MuxError::DmlInFailover);
                    }
                    Ok(false) => {
                        if let Err(e) = held.pool.return_worker(&held.worker, held.ticket) {
                            debug!(session = self.session, error = %e, "primary worker return failed");
                        }
                        if ok {
                            shard_taf.notify_ok();
                            return Ok(());
                        }
                        shard_taf.notify_error();
                        info!(session = self.session, sqlhash = self.sqlhash, pct = shard_taf.pct(), "retryable error on primary, failing over");
                        self.core.sink.emit(
                            Event::new(EventKind::Taf, "rq_failover")
                                .warning()
                                .with("sql", self.sqlhash)
                                .with("shard", shard_id),
                        );
                    }
                    Err(e) => {
                        if e == MuxError::WorkerFail {
                            held.pool.release_ticket(&held.worker, held.ticket);
                        } else {
                            held.recover_in_background(InterruptReason::Failover);
                        }
                        if e == MuxError::Timeout && shard_taf.pct() >= 105 {
                            taf.queries(shard_id).record_timeout(self.sqlhash);
                        }
                        if sent {
                            return Err(e);
                        }
                        match e {
                            MuxError::Timeout => {
                                shard_taf.notify_error();
                                info!(session = self.session, sqlhash = self.sqlhash, pct = shard_taf.pct(), "primary timed out, failing over");
                                self.core.sink.emit(
                                    Event::new(EventKind::Taf, "taf_timeout")
                                        .warning()
                                        .with("sql", self.sqlhash)
                                        .with("shard", shard_id),
                                );
                            }
                            MuxError::WorkerFail if !ok => shard_taf.notify_error(),
                            other => return Err(other),
                        }
                    }
                }
            }
        }

        let (worker, ticket) = standby.get_worker(self.sqlhash, None).await?;
        let held = HeldWorker {
            worker,
            pool: standby,
            ticket,
        };
        let mut relay = Relay::Direct;
        match self.do_request(&held.worker, &request, &mut relay, None).await {
            Ok(true) => {
                held.recover_in_background(InterruptReason::Failover);
                Err(MuxError::DmlInFailover)
            }
            other => self.settle(held, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_all_rewrites_fetch_size() {
        let frames = vec![
            Frame::new(codes::PREPARE, "select a from t"),
            Frame::empty(codes::EXECUTE),
            Frame::new(codes::FETCH, "100"),
        ];
        let request = Frame::composite(&frames);
        let out = fetch_all(&request, &frames).sub_frames().unwrap();
        assert_eq!(out[2], Frame::new(codes::FETCH, "0"));
        assert_eq!(out[0], frames[0]);

        let plain = Frame::new(codes::PREPARE, "select 1 from dual");
        assert_eq!(fetch_all(&plain, &[plain.clone()]), plain);
    }
}
