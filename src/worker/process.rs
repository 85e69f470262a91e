//! Worker process lifecycle
//!
//! A launcher produces a [`WorkerProcess`]: a handle to signal the process plus
//! the data and control byte streams. The default [`CommandLauncher`] runs an
//! external program that connects back over a Unix socket.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::WorkerKind;
use crate::error::MuxError;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which worker to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRequest {
    pub kind: WorkerKind,
    pub shard_id: usize,
    pub inst_id: usize,
    pub id: usize,
}

/// Signals a running worker process
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Ask the process to exit (SIGTERM)
    fn terminate(&self);

    /// Kill the process outright
    fn kill(&self);

    fn has_exited(&self) -> bool;
}

/// Byte streams connected to one worker
pub struct WorkerIo {
    pub data_reader: BoxReader,
    pub data_writer: BoxWriter,
    pub ctrl_writer: BoxWriter,
}

pub struct WorkerProcess {
    pub io: WorkerIo,
    pub handle: Box<dyn ProcessHandle>,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, req: SpawnRequest) -> Result<WorkerProcess, MuxError>;
}

/// [`ProcessHandle`] over a `tokio::process::Child`
pub struct ChildHandle {
    pid: Option<u32>,
    child: Mutex<Child>,
}

impl ChildHandle {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
        }
    }
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self) {
        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }
    }

    fn kill(&self) {
        if let Err(e) = self.child.lock().start_kill() {
            debug!(pid = ?self.pid, error = %e, "kill failed");
        }
    }

    fn has_exited(&self) -> bool {
        !matches!(self.child.lock().try_wait(), Ok(None))
    }
}

/// Runs `program args..` per worker
///
/// The child receives `DBMUX_WORKER_SOCKET` and is expected to connect twice:
/// first the data stream, then the control stream. Identity is passed in
/// `DBMUX_WORKER_TYPE`, `DBMUX_SHARD_ID`, `DBMUX_INSTANCE_ID` and
/// `DBMUX_WORKER_ID`.
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    socket_dir: PathBuf,
    connect_timeout: Duration,
    seq: AtomicU64,
}

impl CommandLauncher {
    pub fn new(command: &[String]) -> Result<Self, MuxError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| MuxError::Spawn("server.worker_command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            socket_dir: std::env::temp_dir(),
            connect_timeout: Duration::from_secs(10),
            seq: AtomicU64::new(0),
        })
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn spawn(&self, req: SpawnRequest) -> Result<WorkerProcess, MuxError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self.socket_dir.join(format!(
            "dbmux-{}-{}-{}-{}-{}.sock",
            std::process::id(),
            req.kind,
            req.shard_id,
            req.id,
            seq
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .map_err(|e| MuxError::Spawn(format!("bind {}: {}", path.display(), e)))?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .env("DBMUX_WORKER_SOCKET", &path)
            .env("DBMUX_WORKER_TYPE", req.kind.as_str())
            .env("DBMUX_SHARD_ID", req.shard_id.to_string())
            .env("DBMUX_INSTANCE_ID", req.inst_id.to_string())
            .env("DBMUX_WORKER_ID", req.id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MuxError::Spawn(format!("{}: {}", self.program, e)));
        let child = match child {
            Ok(c) => c,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };
        let handle = ChildHandle::new(child);

        let accepted = tokio::time::timeout(self.connect_timeout, async {
            let (data, _) = listener.accept().await?;
            let (ctrl, _) = listener.accept().await?;
            Ok::<_, std::io::Error>((data, ctrl))
        })
        .await;
        let _ = std::fs::remove_file(&path);

        let (data, ctrl) = match accepted {
            Ok(Ok(streams)) => streams,
            Ok(Err(e)) => {
                handle.kill();
                return Err(MuxError::Spawn(format!("accept: {}", e)));
            }
            Err(_) => {
                handle.kill();
                return Err(MuxError::Spawn("worker did not connect in time".to_string()));
            }
        };

        info!(
            pid = ?handle.pid(),
            kind = %req.kind,
            shard = req.shard_id,
            id = req.id,
            "worker process connected"
        );

        let (data_reader, data_writer) = data.into_split();
        let (_, ctrl_writer) = ctrl.into_split();
        Ok(WorkerProcess {
            io: WorkerIo {
                data_reader: Box::new(data_reader),
                data_writer: Box::new(data_writer),
                ctrl_writer: Box::new(ctrl_writer),
            },
            handle: Box::new(handle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(matches!(CommandLauncher::new(&[]), Err(MuxError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let dir = tempfile::TempDir::new().unwrap();
        let launcher = CommandLauncher::new(&["/nonexistent/dbmux-worker".to_string()])
            .unwrap()
            .with_socket_dir(dir.path());

        let req = SpawnRequest {
            kind: WorkerKind::ReadWrite,
            shard_id: 0,
            inst_id: 0,
            id: 0,
        };
        assert!(matches!(launcher.spawn(req).await, Err(MuxError::Spawn(_))));
    }
}
