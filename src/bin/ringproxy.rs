//! ringproxy binary

use clap::{Parser, Subcommand};
use ringproxy::placement::{bucket_routing_key, source_from_config};
use ringproxy::{Config, DataDirector, KeyTransform, ProxyServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringproxy")]
#[command(about = "Sharding RPC proxy over a consistent-hash ring")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $RINGPROXY_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy
    Serve {
        /// Bind address for RPC
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Bind address for /metrics and /status
        #[arg(long)]
        monitor: Option<SocketAddr>,
    },

    /// Print where a bucket or object is routed
    Locate {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        bucket: String,

        /// Object key (bucket location if omitted)
        #[arg(long)]
        key: Option<String>,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Serve { bind, monitor } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(monitor) = monitor {
                config.server.monitor_addr = monitor;
            }
            ProxyServer::init(config).await?.serve().await?;
        }
        Commands::Locate { owner, bucket, key } => {
            let source = source_from_config(&config)?;
            let director =
                DataDirector::init(source.as_ref(), KeyTransform::from_config(&config)).await?;
            let (routing_key, location) = match &key {
                Some(key) => (
                    director.object_routing_key(&owner, &bucket, key),
                    director.object_location(&owner, &bucket, key)?,
                ),
                None => (
                    bucket_routing_key(&owner, &bucket),
                    director.bucket_location(&owner, &bucket)?,
                ),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "routing_key": routing_key,
                    "vnode": location.vnode,
                    "pnode": location.pnode,
                    "read_only": location.read_only,
                }))?
            );
        }
    }

    Ok(())
}
