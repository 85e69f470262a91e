use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbmux::{config, proxy, Core};

#[derive(Parser)]
#[command(name = "dbmux")]
#[command(version, about = "Database access multiplexer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the multiplexer
    Serve {
        /// Address to listen on (overrides server.listen_addr)
        #[arg(long)]
        listen: Option<String>,

        /// Worker processes per shard (overrides pool.num_workers)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::Serve { listen, workers } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if let Some(n) = workers {
                config.pool.num_workers = n;
                config.validate()?;
            }

            let mut builder = tokio::runtime::Builder::new_multi_thread();
            if config.server.worker_threads > 0 {
                builder.worker_threads(config.server.worker_threads);
            }
            let runtime = builder.enable_all().build()?;
            runtime.block_on(serve(config))
        }
    }
}

async fn serve(config: config::Config) -> Result<()> {
    let listen = config.server.listen_addr.clone();
    let core = Core::new(config)?;
    proxy::run_server(&core, &listen).await
}
