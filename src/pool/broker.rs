use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::state::PoolKey;
use super::worker_pool::{PoolDeps, WorkerPool};
use crate::config::Config;
use crate::error::MuxError;
use crate::worker::WorkerKind;

/// Owner of every worker pool
///
/// Read-write pools exist for every shard. Read-only pools exist when a
/// read share is configured, standby pools when failover is enabled.
pub struct WorkerBroker {
    config: Arc<Config>,
    deps: PoolDeps,
    pools: HashMap<PoolKey, Arc<WorkerPool>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerBroker {
    pub fn new(config: Arc<Config>, deps: PoolDeps) -> Self {
        let total = deps.tunables.num_workers();
        let mut kinds = vec![WorkerKind::ReadWrite];
        if config.pool.readonly_children_pct > 0 {
            kinds.push(WorkerKind::ReadOnly);
        }
        if config.taf.enabled {
            kinds.push(WorkerKind::Standby);
        }

        let mut pools = HashMap::new();
        for shard in 0..config.shard_count() {
            for &kind in &kinds {
                let key = PoolKey::new(kind, shard, 0);
                let size = config.pool_size(kind, total);
                pools.insert(key, WorkerPool::new(key, size, &config, deps.clone()));
            }
        }

        Self {
            config,
            deps,
            pools,
            watcher: Mutex::new(None),
        }
    }

    /// Start every pool and the worker-count watcher
    pub fn start(&self) {
        for pool in self.pools.values() {
            pool.start();
        }

        let mut rx = self.deps.tunables.subscribe_num_workers();
        let config = self.config.clone();
        let pools: Vec<Arc<WorkerPool>> = self.pools.values().cloned().collect();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let total = *rx.borrow_and_update();
                info!(num_workers = total, "worker count changed");
                for pool in &pools {
                    pool.resize(config.pool_size(pool.key().kind, total));
                }
            }
            debug!("worker count watcher stopped");
        });
        *self.watcher.lock() = Some(handle);
        info!(pools = self.pools.len(), "worker broker started");
    }

    pub fn pool(&self, kind: WorkerKind, shard_id: usize, inst_id: usize) -> Result<Arc<WorkerPool>, MuxError> {
        let key = PoolKey::new(kind, shard_id, inst_id);
        self.pools
            .get(&key)
            .cloned()
            .ok_or_else(|| MuxError::PoolNotFound(key.to_string()))
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<WorkerPool>> {
        self.pools.values()
    }

    /// Some pool has at least one connected worker
    pub fn has_healthy_worker(&self) -> bool {
        self.pools.values().any(|p| p.healthy_count() > 0)
    }

    /// Some read-write pool still has backlog room
    pub fn has_capacity(&self) -> bool {
        let pct = self.config.backlog.backlog_pct;
        self.pools
            .values()
            .filter(|p| p.key().kind == WorkerKind::ReadWrite)
            .any(|p| p.backlog() * 100 < pct * p.desired_size().max(1))
    }

    /// Resize every pool for a new per-shard worker total
    pub fn resize_all(&self, total: usize) {
        self.deps.tunables.set_num_workers(total);
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        for pool in self.pools.values() {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeTunables;
    use crate::pool::{BindEvictionTable, StateRegistry};
    use crate::telemetry::NullSink;
    use crate::worker::sim::SimLauncher;

    fn deps(config: &Config) -> PoolDeps {
        PoolDeps {
            tunables: Arc::new(RuntimeTunables::new(config)),
            launcher: Arc::new(SimLauncher::default()),
            registry: Arc::new(StateRegistry::new()),
            bind_evict: Arc::new(BindEvictionTable::new(config.bind_eviction.clone())),
            sink: Arc::new(NullSink),
        }
    }

    #[test]
    fn test_pool_layout() {
        let mut config = Config::default();
        config.pool.num_workers = 10;
        config.pool.readonly_children_pct = 40;
        config.taf.enabled = true;
        config.sharding.enabled = true;
        config.sharding.num_shards = 2;
        config.sharding.shard_key_name = "id".to_string();

        let deps = deps(&config);
        let broker = WorkerBroker::new(Arc::new(config), deps);

        assert_eq!(broker.pools().count(), 6);
        assert_eq!(broker.pool(WorkerKind::ReadWrite, 1, 0).unwrap().desired_size(), 6);
        assert_eq!(broker.pool(WorkerKind::ReadOnly, 0, 0).unwrap().desired_size(), 4);
        assert_eq!(broker.pool(WorkerKind::Standby, 1, 0).unwrap().desired_size(), 10);
        assert!(matches!(
            broker.pool(WorkerKind::ReadWrite, 2, 0),
            Err(MuxError::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resize_follows_tunables() {
        let mut config = Config::default();
        config.pool.num_workers = 2;
        let deps = deps(&config);
        let broker = WorkerBroker::new(Arc::new(config), deps);
        broker.start();

        let pool = broker.pool(WorkerKind::ReadWrite, 0, 0).unwrap();
        assert!(pool.wait_healthy(2, std::time::Duration::from_secs(2)).await);

        broker.resize_all(4);
        assert!(pool.wait_healthy(4, std::time::Duration::from_secs(2)).await);
        assert_eq!(pool.desired_size(), 4);

        broker.shutdown().await;
    }
}
