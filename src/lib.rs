//! dbmux - database access multiplexer
//!
//! Clients speak a netstring protocol to the multiplexer, which hands each
//! statement to one of a pool of long-lived database worker processes.

pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod shard;
pub mod taf;
pub mod telemetry;
pub mod worker;

pub use crate::core::Core;
pub use config::Config;
pub use error::MuxError;
