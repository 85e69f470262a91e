//! Helpers shared by the session-level integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use dbmux::protocol::{codes, write_frame, Frame, FrameReader};
use dbmux::proxy::spawn_session;
use dbmux::telemetry::MemorySink;
use dbmux::worker::sim::SimLauncher;
use dbmux::{Config, Core};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Core backed by simulated workers, started and with every pool connected
pub async fn start_core(config: Config) -> (Core, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let core = Core::with_launcher(config, Arc::new(SimLauncher::default()), sink.clone())
        .expect("core");
    core.start();
    for pool in core.broker.pools() {
        assert!(
            pool.wait_healthy(pool.desired_size(), Duration::from_secs(5)).await,
            "pool {} never became healthy",
            pool.key()
        );
    }
    (core, sink)
}

/// Poll `cond` every 10ms until it holds or `within` passes
pub async fn wait_for(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Composite request: prepare, binds, execute
pub fn statement(sql: &str, binds: &[(&str, &str)]) -> Frame {
    let mut frames = vec![Frame::new(codes::PREPARE, sql.to_string())];
    for (name, value) in binds {
        frames.push(Frame::new(codes::BIND_NAME, name.to_string()));
        frames.push(Frame::new(codes::BIND_VALUE, value.to_string()));
    }
    frames.push(Frame::empty(codes::EXECUTE));
    Frame::composite(&frames)
}

/// Like [`statement`], asking for at most `fetch_size` rows
pub fn statement_with_fetch(sql: &str, binds: &[(&str, &str)], fetch_size: &str) -> Frame {
    let mut frames = statement(sql, binds).sub_frames().expect("composite");
    frames.push(Frame::new(codes::FETCH, fetch_size.to_string()));
    Frame::composite(&frames)
}

/// Client end of an in-memory session
pub struct TestClient {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl TestClient {
    pub fn connect(core: &Core) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        spawn_session(core.clone(), server);
        let (r, w) = tokio::io::split(client);
        Self {
            reader: FrameReader::new(r),
            writer: w,
        }
    }

    pub async fn send(&mut self, frame: &Frame) {
        write_frame(&mut self.writer, frame).await.expect("send");
    }

    /// Next frame from the multiplexer; `None` once it hung up
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(RECV_TIMEOUT, self.reader.next_frame())
            .await
            .expect("no reply in time")
            .expect("malformed reply")
    }

    pub async fn ping(&mut self) -> bool {
        self.send(&Frame::empty(codes::SERVER_PING)).await;
        matches!(self.recv().await, Some(f) if f.cmd == codes::SERVER_ALIVE)
    }

    /// Frames of a plain read: two values then no-more-data
    pub async fn expect_rows(&mut self) {
        let first = self.recv().await.expect("first row");
        assert_eq!(first, Frame::new(codes::RC_VALUE, "1"));
        let second = self.recv().await.expect("second row");
        assert_eq!(second, Frame::new(codes::RC_VALUE, "42"));
        let done = self.recv().await.expect("end of rows");
        assert_eq!(done.cmd, codes::RC_NO_MORE_DATA);
    }

    /// Next frame must be an error carrying `text`
    pub async fn expect_error(&mut self, text: &str) {
        let frame = self.recv().await.expect("error frame");
        assert_eq!(frame.cmd, codes::RC_ERROR, "unexpected {:?}", frame);
        assert_eq!(frame.payload_str(), text);
    }
}
