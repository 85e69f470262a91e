//! In-process worker used by tests and demos
//!
//! Each simulated worker speaks the worker protocol over `tokio::io::duplex`
//! streams: handshake, request frames, data frames followed by one
//! end-of-request, and interrupts on the control stream.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::process::{ProcessHandle, ProcessLauncher, SpawnRequest, WorkerIo, WorkerProcess};
use crate::error::MuxError;
use crate::protocol::sql::statement_text;
use crate::protocol::{codes, parse_binds, write_frame, BindPair, EorCode, Frame, FrameReader};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Request as seen by a simulated worker
#[derive(Debug, Clone)]
pub struct SimRequest {
    pub frames: Vec<Frame>,
    pub sql: Option<String>,
    pub binds: Vec<BindPair>,
    pub in_transaction: bool,
}

impl SimRequest {
    pub fn has_cmd(&self, cmd: i32) -> bool {
        self.frames.iter().any(|f| f.cmd == cmd)
    }
}

/// How a simulated worker answers one request
#[derive(Debug, Clone)]
pub struct SimReply {
    pub delay: Duration,
    pub frames: Vec<Frame>,
    pub eor: EorCode,
    /// Keep running when interrupted
    pub ignore_interrupt: bool,
}

impl SimReply {
    pub fn new(frames: Vec<Frame>, eor: EorCode) -> Self {
        Self {
            delay: Duration::ZERO,
            frames,
            eor,
            ignore_interrupt: false,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub trait SimScript: Send + Sync + 'static {
    fn respond(&self, req: &SimRequest) -> SimReply;
}

/// Behaviour driven by markers in the statement text
///
/// - `sleep(<ms>)` delays the reply
/// - `hang` delays for a minute and ignores interrupts
/// - `ora(<n>)` replies with an SQL error numbered `n`
/// - reads answer two values, fewer when a smaller fetch size leaves the
///   cursor open; writes open a transaction
/// - commit and rollback close it
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultScript;

fn marker_arg(sql: &str, marker: &str) -> Option<u64> {
    let start = sql.find(marker)? + marker.len();
    let rest = &sql[start..];
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}

impl SimScript for DefaultScript {
    fn respond(&self, req: &SimRequest) -> SimReply {
        if req.has_cmd(codes::COMMIT) || req.has_cmd(codes::ROLLBACK) {
            return SimReply::new(vec![Frame::empty(codes::RC_OK)], EorCode::Free);
        }

        let Some(sql) = req.sql.as_deref() else {
            let eor = if req.in_transaction {
                EorCode::InTransaction
            } else {
                EorCode::Free
            };
            return SimReply::new(vec![Frame::empty(codes::RC_NO_MORE_DATA)], eor);
        };
        let lower = sql.to_ascii_lowercase();

        let delay = marker_arg(&lower, "sleep(")
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);

        if let Some(code) = marker_arg(&lower, "ora(") {
            let frames = vec![Frame::new(
                codes::RC_SQL_ERROR,
                format!("{}: ORA-{:05}: simulated failure", code, code),
            )];
            return SimReply::new(frames, EorCode::Free).after(delay);
        }

        if lower.contains("hang") {
            return SimReply {
                delay: Duration::from_secs(60),
                frames: vec![Frame::empty(codes::RC_OK)],
                eor: EorCode::Free,
                ignore_interrupt: true,
            };
        }

        let first = lower.split_whitespace().next().unwrap_or("");
        let is_write = matches!(first, "insert" | "update" | "delete" | "merge")
            || lower.contains("for update");
        if is_write {
            return SimReply::new(
                vec![Frame::new(codes::RC_VALUE, "1"), Frame::empty(codes::RC_OK)],
                EorCode::InTransaction,
            )
            .after(delay);
        }

        let mut frames = vec![Frame::new(codes::RC_VALUE, "1"), Frame::new(codes::RC_VALUE, "42")];
        let fetch_size = req
            .frames
            .iter()
            .find(|f| f.cmd == codes::FETCH)
            .and_then(|f| f.payload_str().trim().parse::<usize>().ok())
            .unwrap_or(0);
        if fetch_size > 0 && fetch_size < frames.len() {
            frames.truncate(fetch_size);
            frames.push(Frame::empty(codes::RC_OK));
            let eor = if req.in_transaction {
                EorCode::InCursorInTransaction
            } else {
                EorCode::InCursorNotInTransaction
            };
            return SimReply::new(frames, eor).after(delay);
        }

        frames.push(Frame::empty(codes::RC_NO_MORE_DATA));
        let eor = if req.in_transaction {
            EorCode::InTransaction
        } else {
            EorCode::Free
        };
        SimReply::new(frames, eor).after(delay)
    }
}

struct SimHandle {
    stop: CancellationToken,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle for SimHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&self) {
        self.stop.cancel();
    }

    fn kill(&self) {
        self.stop.cancel();
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// [`ProcessLauncher`] producing simulated workers
pub struct SimLauncher {
    script: Arc<dyn SimScript>,
    spawned: AtomicUsize,
    fail_spawns: AtomicBool,
}

impl Default for SimLauncher {
    fn default() -> Self {
        Self::new(DefaultScript)
    }
}

impl SimLauncher {
    pub fn new(script: impl SimScript) -> Self {
        Self {
            script: Arc::new(script),
            spawned: AtomicUsize::new(0),
            fail_spawns: AtomicBool::new(false),
        }
    }

    /// Workers started so far
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Make subsequent spawns fail, e.g. to simulate a dead database host
    pub fn set_fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl ProcessLauncher for SimLauncher {
    async fn spawn(&self, req: SpawnRequest) -> Result<WorkerProcess, MuxError> {
        if self.fail_spawns.load(Ordering::Relaxed) {
            return Err(MuxError::Spawn("simulated spawn failure".to_string()));
        }
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let (proxy_data, worker_data) = tokio::io::duplex(PIPE_CAPACITY);
        let (proxy_ctrl, worker_ctrl) = tokio::io::duplex(PIPE_CAPACITY);
        let stop = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_sim(
            self.script.clone(),
            req,
            worker_data,
            worker_ctrl,
            stop.clone(),
            exited.clone(),
        ));

        let (data_reader, data_writer) = tokio::io::split(proxy_data);
        Ok(WorkerProcess {
            io: WorkerIo {
                data_reader: Box::new(data_reader),
                data_writer: Box::new(data_writer),
                ctrl_writer: Box::new(proxy_ctrl),
            },
            handle: Box::new(SimHandle { stop, exited }),
        })
    }
}

async fn run_sim(
    script: Arc<dyn SimScript>,
    req: SpawnRequest,
    data: DuplexStream,
    ctrl: DuplexStream,
    stop: CancellationToken,
    exited: Arc<AtomicBool>,
) {
    let (data_r, mut data_w) = tokio::io::split(data);
    let mut reader = FrameReader::new(data_r);
    let mut ctrl_reader = FrameReader::new(ctrl);

    let hello = Frame::new(codes::CONTROL_MSG, format!("{} simdb_{}", req.inst_id, req.shard_id));
    if write_frame(&mut data_w, &hello).await.is_err() {
        exited.store(true, Ordering::Release);
        return;
    }

    let mut rq_id: u16 = 0;
    let mut in_txn = false;
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            f = reader.next_frame() => match f {
                Ok(Some(f)) => f,
                _ => break,
            },
            c = ctrl_reader.next_frame() => match c {
                Ok(Some(_)) => {
                    in_txn = false;
                    if write_frame(&mut data_w, &Frame::eor(EorCode::Free, rq_id, &[])).await.is_err() {
                        break;
                    }
                    continue;
                }
                _ => break,
            },
        };

        rq_id = rq_id.wrapping_add(frame.request_count());
        let frames = frame.sub_frames().unwrap_or_default();
        let request = SimRequest {
            sql: statement_text(&frames),
            binds: parse_binds(&frames),
            frames,
            in_transaction: in_txn,
        };
        let reply = script.respond(&request);

        let interrupted = if reply.delay.is_zero() {
            false
        } else {
            tokio::select! {
                _ = tokio::time::sleep(reply.delay) => false,
                _ = stop.cancelled() => break,
                c = ctrl_reader.next_frame(), if !reply.ignore_interrupt => match c {
                    Ok(Some(_)) => true,
                    _ => break,
                },
            }
        };

        if interrupted {
            debug!(worker = req.id, rq_id, "simulated worker interrupted");
            in_txn = false;
            if write_frame(&mut data_w, &Frame::eor(EorCode::Free, rq_id, &[])).await.is_err() {
                break;
            }
            continue;
        }

        let mut failed = false;
        for f in &reply.frames {
            if write_frame(&mut data_w, f).await.is_err() {
                failed = true;
                break;
            }
        }
        if failed || write_frame(&mut data_w, &Frame::eor(reply.eor, rq_id, &[])).await.is_err() {
            break;
        }
        in_txn = reply.eor.in_transaction();
    }

    exited.store(true, Ordering::Release);
}
