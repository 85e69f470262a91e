//! Error taxonomy of the multiplexer
//!
//! Client-visible conditions carry a numeric code and are rendered as
//! `"<prefix>-<code>: <text>"` inside an RcError frame. The remaining
//! variants describe transport, worker and internal failures.

use bytes::Bytes;

use crate::protocol::{codes, Frame};

/// Broad class of a [`MuxError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No worker obtainable right now
    Admission,
    /// Worker reclaimed mid-request
    Saturation,
    /// Hot bind value throttled or evicted
    BindEviction,
    /// Shard routing violation
    Sharding,
    /// Worker, client or deadline failure
    Transport,
    /// Malformed client request
    Parse,
    /// Pool bookkeeping violation
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    #[error("backlog timeout")]
    BacklogTimeout,

    #[error("saturation kill")]
    SaturationKill,

    #[error("backlog eviction")]
    BacklogEviction,

    #[error("request rejected, database down")]
    RejectDbDown,

    #[error("saturation soft sql eviction")]
    SaturationSoftEviction,

    #[error("bind throttle")]
    BindThrottle,

    #[error("bind eviction")]
    BindEviction,

    #[error("cross shard dml")]
    CrossShardDml,

    #[error("shard id out of range")]
    BadShardId,

    #[error("changing shard_id while in txn")]
    ChangeShardIdInTxn,

    #[error("scuttle/wl markdown for read")]
    ScuttleMarkdownRead,

    #[error("scuttle/wl markdown for write")]
    ScuttleMarkdownWrite,

    #[error("cross key dml")]
    CrossKeysDml,

    #[error("no scuttle_id predicate, please remove scuttle_id in sql")]
    NoScuttleIdPredicate,

    #[error("no shard key or more than one or bad logical db")]
    NoShardKey,

    #[error("autodiscover while set shard id")]
    AutodiscoverWhileSetShardId,

    #[error("no shard value or wrong shard key array binding")]
    NoShardValue,

    #[error("unsupported both set shard id and shard key")]
    ShardIdAndKey,

    #[error("no worker available")]
    NoWorkerAvailable,

    #[error("worker returned with a stale ticket")]
    TicketMismatch,

    #[error("worker already dispatched")]
    DoubleDispatch,

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("client failure")]
    ClientFail,

    #[error("worker failure")]
    WorkerFail,

    #[error("timeout")]
    Timeout,

    #[error("canceled")]
    Canceled,

    #[error("request error: {0}")]
    RequestParse(String),

    #[error("DML not allowed")]
    DmlInFailover,

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl MuxError {
    /// Numeric code of client-visible conditions
    pub fn code(&self) -> Option<u16> {
        let code = match self {
            MuxError::BacklogTimeout => 100,
            MuxError::SaturationKill => 101,
            MuxError::BacklogEviction => 102,
            MuxError::RejectDbDown => 103,
            MuxError::SaturationSoftEviction => 104,
            MuxError::BindThrottle => 105,
            MuxError::BindEviction => 106,
            MuxError::CrossShardDml => 200,
            MuxError::BadShardId => 201,
            MuxError::ChangeShardIdInTxn => 203,
            MuxError::ScuttleMarkdownRead => 204,
            MuxError::ScuttleMarkdownWrite => 205,
            MuxError::CrossKeysDml => 206,
            MuxError::NoScuttleIdPredicate => 372,
            MuxError::NoShardKey => 373,
            MuxError::AutodiscoverWhileSetShardId => 374,
            MuxError::NoShardValue => 375,
            _ => return None,
        };
        Some(code)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MuxError::BacklogTimeout
            | MuxError::BacklogEviction
            | MuxError::RejectDbDown
            | MuxError::SaturationSoftEviction
            | MuxError::NoWorkerAvailable => ErrorKind::Admission,
            MuxError::SaturationKill => ErrorKind::Saturation,
            MuxError::BindThrottle | MuxError::BindEviction => ErrorKind::BindEviction,
            MuxError::CrossShardDml
            | MuxError::BadShardId
            | MuxError::ChangeShardIdInTxn
            | MuxError::ScuttleMarkdownRead
            | MuxError::ScuttleMarkdownWrite
            | MuxError::CrossKeysDml
            | MuxError::NoScuttleIdPredicate
            | MuxError::NoShardKey
            | MuxError::AutodiscoverWhileSetShardId
            | MuxError::NoShardValue
            | MuxError::ShardIdAndKey => ErrorKind::Sharding,
            MuxError::ClientFail
            | MuxError::WorkerFail
            | MuxError::Timeout
            | MuxError::Canceled
            | MuxError::DmlInFailover
            | MuxError::Spawn(_)
            | MuxError::Transport(_) => ErrorKind::Transport,
            MuxError::RequestParse(_) => ErrorKind::Parse,
            MuxError::TicketMismatch | MuxError::DoubleDispatch | MuxError::PoolNotFound(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Admission failures leave the client session open
    pub fn is_admission(&self) -> bool {
        self.kind() == ErrorKind::Admission
    }

    /// Text sent to clients, e.g. `HERA-100: backlog timeout`
    pub fn wire_text(&self, prefix: &str) -> String {
        match self.code() {
            Some(code) => format!("{}-{}: {}", prefix, code, self),
            None => self.to_string(),
        }
    }

    /// RcError frame carrying [`MuxError::wire_text`]
    pub fn to_frame(&self, prefix: &str) -> Frame {
        Frame::new(codes::RC_ERROR, Bytes::from(self.wire_text(prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_text() {
        assert_eq!(
            MuxError::BacklogTimeout.wire_text("HERA"),
            "HERA-100: backlog timeout"
        );
        assert_eq!(
            MuxError::BindEviction.wire_text("OCC"),
            "OCC-106: bind eviction"
        );
        assert_eq!(MuxError::Timeout.wire_text("HERA"), "timeout");
    }

    #[test]
    fn test_kinds() {
        assert!(MuxError::BacklogEviction.is_admission());
        assert!(MuxError::RejectDbDown.is_admission());
        assert!(!MuxError::SaturationKill.is_admission());
        assert_eq!(MuxError::CrossKeysDml.kind(), ErrorKind::Sharding);
        assert_eq!(MuxError::RequestParse("x".into()).kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_error_frame() {
        let frame = MuxError::BindThrottle.to_frame("HERA");
        assert_eq!(frame.cmd, codes::RC_ERROR);
        assert_eq!(&frame.payload[..], b"HERA-105: bind throttle");
    }
}
