//! Wire protocol shared by clients and workers
//!
//! - Netstring frames with nested composite frames
//! - Command tags, return codes and end-of-request codes
//! - Async frame reader and writer
//! - Statement fingerprints, classification and bind extraction

pub mod codes;
mod frame;
mod reader;
pub mod sql;

pub use codes::{EorCode, InterruptReason};
pub use frame::{decode, Frame, FrameError, MAX_FRAME_LEN};
pub use reader::{write_frame, FrameReader};
pub use sql::{parse_binds, sql_hash, BindPair, KeywordClassifier, StatementClassifier};
