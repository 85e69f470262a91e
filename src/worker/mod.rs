//! Worker processes
//!
//! - [`WorkerClient`]: handle, read loop, write path and recovery protocol
//! - [`WorkerTelemetry`]: lock-free fields read by background recovery
//! - [`ProcessLauncher`]: how worker processes come to life
//! - [`sim`]: in-process workers speaking the same protocol

mod client;
mod process;
pub mod sim;
mod state;

pub use client::{ControlMsg, WorkerClient, WorkerMsg, WorkerSpec};
pub use process::{
    BoxReader, BoxWriter, ChildHandle, CommandLauncher, ProcessHandle, ProcessLauncher,
    SpawnRequest, WorkerIo, WorkerProcess,
};
pub use state::{
    instant_ms, monotonic_ms, TelemetrySnapshot, WorkerKind, WorkerState, WorkerTelemetry,
};
