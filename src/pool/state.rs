//! Per-pool worker state accounting
//!
//! Workers push every state change into their pool's counters; admission
//! control and saturation recovery read them without touching the pool lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::worker::{WorkerKind, WorkerState};

/// Identity of one pool: kind, shard and instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub kind: WorkerKind,
    pub shard_id: usize,
    pub inst_id: usize,
}

impl PoolKey {
    pub fn new(kind: WorkerKind, shard_id: usize, inst_id: usize) -> Self {
        Self {
            kind,
            shard_id,
            inst_id,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind, self.shard_id, self.inst_id)
    }
}

/// Number of workers in each state for one pool
#[derive(Debug, Default)]
pub struct PoolStateCounters {
    by_state: [AtomicI64; WorkerState::COUNT],
}

impl PoolStateCounters {
    pub(crate) fn enter(&self, state: WorkerState) {
        self.by_state[state as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transition(&self, old: WorkerState, new: WorkerState) {
        self.by_state[old as usize].fetch_sub(1, Ordering::Relaxed);
        self.by_state[new as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, state: WorkerState) -> i64 {
        self.by_state[state as usize].load(Ordering::Relaxed).max(0)
    }

    /// Idle workers
    pub fn free(&self) -> i64 {
        self.count(WorkerState::Accept)
    }

    /// Workers being forcibly reclaimed
    pub fn stranded(&self) -> i64 {
        self.count(WorkerState::Quiesce)
    }

    pub fn snapshot(&self) -> [i64; WorkerState::COUNT] {
        std::array::from_fn(|i| self.by_state[i].load(Ordering::Relaxed).max(0))
    }
}

/// Registry of [`PoolStateCounters`] for every pool
#[derive(Debug, Default)]
pub struct StateRegistry {
    pools: RwLock<HashMap<PoolKey, Arc<PoolStateCounters>>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `key`, created on first use
    pub fn register(&self, key: PoolKey) -> Arc<PoolStateCounters> {
        if let Some(c) = self.pools.read().get(&key) {
            return c.clone();
        }
        self.pools.write().entry(key).or_default().clone()
    }

    pub fn get(&self, key: &PoolKey) -> Option<Arc<PoolStateCounters>> {
        self.pools.read().get(key).cloned()
    }

    pub fn free_count(&self, key: &PoolKey) -> i64 {
        self.get(key).map_or(0, |c| c.free())
    }

    pub fn stranded_count(&self, key: &PoolKey) -> i64 {
        self.get(key).map_or(0, |c| c.stranded())
    }

    pub fn snapshot(&self) -> Vec<(PoolKey, [i64; WorkerState::COUNT])> {
        let mut out: Vec<_> = self
            .pools
            .read()
            .iter()
            .map(|(k, c)| (*k, c.snapshot()))
            .collect();
        out.sort_by_key(|(k, _)| (k.shard_id, k.kind as u8, k.inst_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_move_counts() {
        let registry = StateRegistry::new();
        let key = PoolKey::new(WorkerKind::ReadWrite, 0, 0);
        let counters = registry.register(key);

        counters.enter(WorkerState::Init);
        counters.enter(WorkerState::Init);
        counters.transition(WorkerState::Init, WorkerState::Accept);
        counters.transition(WorkerState::Accept, WorkerState::Quiesce);

        assert_eq!(registry.free_count(&key), 0);
        assert_eq!(registry.stranded_count(&key), 1);
        assert_eq!(counters.count(WorkerState::Init), 1);
        assert!(Arc::ptr_eq(&counters, &registry.register(key)));
    }
}
