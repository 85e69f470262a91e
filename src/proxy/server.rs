use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::core::Core;
use crate::error::MuxError;
use crate::protocol::{write_frame, FrameReader};
use crate::telemetry::{Event, EventKind};

/// Client listener
pub struct MuxServer {
    core: Core,
    listener: TcpListener,
    started: Instant,
}

impl MuxServer {
    pub async fn bind(core: Core, listen: &str) -> Result<Self> {
        let addr: SocketAddr = listen
            .parse()
            .context(format!("Invalid listen address: {}", listen))?;
        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;
        Ok(Self {
            core,
            listener,
            started: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Whether a new connection should be turned away
    fn bounce(&self) -> bool {
        let server = &self.core.config.server;
        if !server.bouncer_enabled {
            return false;
        }
        if self.started.elapsed() < Duration::from_millis(server.bouncer_startup_delay_ms) {
            return false;
        }
        !self.core.broker.has_healthy_worker() || !self.core.broker.has_capacity()
    }

    /// Accept connections until the core shuts down
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!("dbmux listening on {}", addr);

        let shutdown = self.core.shutdown.clone();
        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };
            let _ = stream.set_nodelay(true);

            if self.bounce() {
                warn!(client = %remote_addr, "no capacity, rejecting connection");
                self.core.sink.emit(
                    Event::new(EventKind::Mux, "bouncer_reject")
                        .warning()
                        .with("client", remote_addr),
                );
                let prefix = self.core.config.server.error_code_prefix.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    let _ = write_frame(&mut stream, &MuxError::NoWorkerAvailable.to_frame(&prefix)).await;
                });
                continue;
            }

            debug!(client = %remote_addr, "client connected");
            spawn_session(self.core.clone(), stream);
        }

        info!("listener stopped");
        Ok(())
    }
}

/// Run one client session over `stream`
///
/// A reader task decodes client frames into a bounded queue consumed by the
/// session's coordinator; the queue closes when the client does.
pub fn spawn_session<S>(core: Core, stream: S) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(core.config.server.client_queue_depth.max(1));

    tokio::spawn(async move {
        let reader = tokio::spawn(async move {
            let mut frames = FrameReader::new(read_half);
            loop {
                match frames.next_frame().await {
                    Ok(Some(frame)) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "client read failed");
                        break;
                    }
                }
            }
        });

        Coordinator::new(core, rx, write_half).run().await;
        reader.abort();
    })
}
