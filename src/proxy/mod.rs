//! Client-facing listener
//!
//! Accepts client connections, turns them away while no pool can serve them,
//! and runs one coordinator per connection.

mod server;

pub use server::{spawn_session, MuxServer};

use anyhow::Result;
use tracing::info;

use crate::core::Core;

/// Start the pools, serve clients on `listen` and stop everything on Ctrl-C
pub async fn run_server(core: &Core, listen: &str) -> Result<()> {
    core.start();
    let server = MuxServer::bind(core.clone(), listen).await?;

    let shutdown = core.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.cancel();
        }
    });

    server.run().await?;
    core.shutdown().await;
    Ok(())
}
