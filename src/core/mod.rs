use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, RuntimeTunables};
use crate::pool::{BindEvictionTable, PoolDeps, StateRegistry, WorkerBroker};
use crate::protocol::{KeywordClassifier, StatementClassifier};
use crate::shard::{ShardMapRefresher, ShardMapStore, ShardRouter};
use crate::taf::TafRegistry;
use crate::telemetry::{EventSink, TracingSink};
use crate::worker::{CommandLauncher, ProcessLauncher};

/// Process-wide state shared by the server and every coordinator
///
/// Clones are cheap and share the same pools, routing tables and tunables.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub tunables: Arc<RuntimeTunables>,
    pub broker: Arc<WorkerBroker>,
    pub shard_router: Arc<ShardRouter>,
    pub shard_maps: Arc<ShardMapStore>,
    pub taf: Arc<TafRegistry>,
    pub bind_evict: Arc<BindEvictionTable>,
    pub registry: Arc<StateRegistry>,
    pub classifier: Arc<dyn StatementClassifier>,
    pub sink: Arc<dyn EventSink>,
    pub shutdown: CancellationToken,
}

impl Core {
    /// Core spawning real worker processes from `server.worker_command`
    pub fn new(config: Config) -> Result<Self> {
        let launcher = CommandLauncher::new(&config.server.worker_command)
            .context("Invalid worker command")?;
        Self::with_launcher(config, Arc::new(launcher), Arc::new(TracingSink))
    }

    pub fn with_launcher(
        config: Config,
        launcher: Arc<dyn ProcessLauncher>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let tunables = Arc::new(RuntimeTunables::new(&config));
        let registry = Arc::new(StateRegistry::new());
        let bind_evict = Arc::new(BindEvictionTable::new(config.bind_eviction.clone()));

        let shard_maps = Arc::new(ShardMapStore::from_settings(&config.sharding));
        if config.sharding.enabled {
            shard_maps
                .reload(&config.sharding, sink.as_ref())
                .context("Failed to load shard map")?;
        }
        let shard_router = Arc::new(ShardRouter::new(
            config.sharding.clone(),
            shard_maps.clone(),
            sink.clone(),
        ));
        let taf = Arc::new(TafRegistry::new(&config.taf, config.shard_count()));

        let deps = PoolDeps {
            tunables: tunables.clone(),
            launcher,
            registry: registry.clone(),
            bind_evict: bind_evict.clone(),
            sink: sink.clone(),
        };
        let broker = Arc::new(WorkerBroker::new(config.clone(), deps));

        Ok(Self {
            config,
            tunables,
            broker,
            shard_router,
            shard_maps,
            taf,
            bind_evict,
            registry,
            classifier: Arc::new(KeywordClassifier),
            sink,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start worker pools and background refreshers
    pub fn start(&self) {
        self.broker.start();

        let sharding = &self.config.sharding;
        let has_files = sharding.shard_map_file.is_some() || sharding.whitelist_file.is_some();
        if sharding.enabled && has_files {
            ShardMapRefresher::new(self.shard_maps.clone(), sharding.clone(), self.sink.clone())
                .start(self.shutdown.child_token());
        }
        info!(
            shards = self.config.shard_count(),
            workers = self.tunables.num_workers(),
            taf = self.config.taf.enabled,
            "core started"
        );
    }

    /// Stop background tasks and terminate every worker
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.broker.shutdown().await;
        info!("core stopped");
    }
}
