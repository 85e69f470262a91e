//! Command tags, return codes and end-of-request codes

// Client and worker commands
pub const COMPOSITE: i32 = 0;
pub const PREPARE: i32 = 1;
pub const BIND_NAME: i32 = 2;
pub const BIND_VALUE: i32 = 3;
pub const EXECUTE: i32 = 4;
pub const ROWS: i32 = 5;
pub const COLS: i32 = 6;
pub const FETCH: i32 = 7;
pub const COMMIT: i32 = 8;
pub const ROLLBACK: i32 = 9;
pub const BIND_TYPE: i32 = 10;
pub const CLIENT_INFO: i32 = 11;
pub const BACKTRACE: i32 = 12;
pub const BIND_OUT_NAME: i32 = 13;
pub const PREPARE_SPECIAL: i32 = 14;
pub const COLS_INFO: i32 = 22;
pub const BIND_NUM: i32 = 23;
pub const BIND_VALUE_MAX_SIZE: i32 = 24;
pub const PREPARE_V2: i32 = 25;
pub const SHARD_KEY: i32 = 27;
pub const GET_NUM_SHARDS: i32 = 28;
pub const SET_SHARD_ID: i32 = 29;
pub const SERVER_PING: i32 = 1008;
pub const SERVER_ALIVE: i32 = 1009;
pub const CORRELATION_ID: i32 = 2006;

// Worker to proxy
pub const CONTROL_MSG: i32 = 501;
pub const EOR: i32 = 502;
/// Out-of-band interrupt on the control stream
pub const INTERRUPT: i32 = 503;

// Return codes
pub const RC_SQL_ERROR: i32 = 1;
pub const RC_ERROR: i32 = 2;
pub const RC_VALUE: i32 = 3;
pub const RC_OK: i32 = 5;
pub const RC_NO_MORE_DATA: i32 = 6;
pub const RC_STILL_EXECUTING: i32 = 7;

/// Prepare variants that start a statement
pub fn is_prepare(cmd: i32) -> bool {
    matches!(cmd, PREPARE | PREPARE_V2 | PREPARE_SPECIAL)
}

/// Status carried by an end-of-request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EorCode {
    Free = 0,
    InTransaction = 1,
    InCursorNotInTransaction = 2,
    InCursorInTransaction = 3,
    MoreIncoming = 4,
}

impl EorCode {
    pub fn from_digit(b: u8) -> Option<Self> {
        match b.checked_sub(b'0')? {
            0 => Some(EorCode::Free),
            1 => Some(EorCode::InTransaction),
            2 => Some(EorCode::InCursorNotInTransaction),
            3 => Some(EorCode::InCursorInTransaction),
            4 => Some(EorCode::MoreIncoming),
            _ => None,
        }
    }

    pub fn digit(self) -> u8 {
        b'0' + self as u8
    }

    pub fn in_transaction(self) -> bool {
        matches!(self, EorCode::InTransaction | EorCode::InCursorInTransaction)
    }
}

/// Why a worker is interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterruptReason {
    /// Client switched to another statement
    Switch = 0,
    /// Client session ended
    ClientGone = 1,
    /// Reclaimed by saturation recovery or bind eviction
    Saturation = 2,
    /// Request deadline passed
    Timeout = 3,
    /// Failover attempt abandoned
    Failover = 4,
    /// Worker recycled or pool shut down
    Shutdown = 5,
}

impl InterruptReason {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => InterruptReason::Switch,
            1 => InterruptReason::ClientGone,
            2 => InterruptReason::Saturation,
            3 => InterruptReason::Timeout,
            4 => InterruptReason::Failover,
            _ => InterruptReason::Shutdown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InterruptReason::Switch => "switch",
            InterruptReason::ClientGone => "client_gone",
            InterruptReason::Saturation => "saturation",
            InterruptReason::Timeout => "timeout",
            InterruptReason::Failover => "failover",
            InterruptReason::Shutdown => "shutdown",
        }
    }
}
