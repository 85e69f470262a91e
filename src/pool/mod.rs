//! Worker pools and their admission control
//!
//! This module provides:
//! - Checkout/return of workers with tickets and LIFO or FIFO scheduling
//! - Adaptive backlog timeouts and saturation recovery
//! - Hot bind value throttling
//! - Per-pool state accounting and the broker owning all pools

mod adaptive;
mod bind_evict;
mod broker;
mod monitor;
mod state;
mod worker_pool;

pub use adaptive::{AdaptiveQueueManager, AqmState, Dispatched};
pub use bind_evict::{normalize_bind_name, BindEvictionTable, BindThrottle, MAX_ALLOW_EVERY_X};
pub use broker::WorkerBroker;
pub use monitor::PoolMonitor;
pub use state::{PoolKey, PoolStateCounters, StateRegistry};
pub use worker_pool::{PoolDeps, PoolSettings, PoolState, PoolStats, Ticket, WorkerPool};
