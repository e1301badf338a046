//! Proxy server
//!
//! Startup order: clear the readiness marker, load the ring, connect one
//! client per shard, write the marker, then serve the RPC and monitor
//! listeners until either stops.

use crate::common::{Config, Error, Result, ShardBackend, ShardConfig};
use crate::placement::{source_from_config, DataDirector, KeyTransform};
use crate::proxy::dispatch::Dispatcher;
use crate::proxy::http::{monitor_router, rpc_router, ProxyState};
use crate::shard::{HttpShardClient, MemoryShard, ShardClient, ShardClientPool};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

/// One client per pnode for the configured backend
pub fn connect_pool(pnodes: &[String], shards: &ShardConfig) -> Result<ShardClientPool> {
    match shards.backend {
        ShardBackend::Memory => ShardClientPool::connect(pnodes, |pnode| {
            Ok(Arc::new(MemoryShard::new(pnode)) as Arc<dyn ShardClient>)
        }),
        ShardBackend::Http => {
            let timeout = shards.request_timeout();
            ShardClientPool::connect(pnodes, |pnode| {
                Ok(Arc::new(HttpShardClient::new(pnode, timeout)?) as Arc<dyn ShardClient>)
            })
        }
    }
}

async fn clear_marker(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub struct ProxyServer {
    config: Config,
    state: ProxyState,
}

impl ProxyServer {
    /// Load the topology and connect to every shard. The readiness marker
    /// exists afterwards only if this succeeded.
    pub async fn init(config: Config) -> Result<Self> {
        config.validate()?;
        clear_marker(&config.readiness_file).await?;

        let source = source_from_config(&config)?;
        let transform = KeyTransform::from_config(&config);
        let director = Arc::new(DataDirector::init(source.as_ref(), transform).await?);

        let pool = Arc::new(connect_pool(&director.pnodes(), &config.shards)?);
        tokio::fs::write(&config.readiness_file, b"").await?;
        tracing::info!(
            shards = pool.len(),
            marker = %config.readiness_file.display(),
            "all shard clients connected"
        );

        let dispatcher = Arc::new(Dispatcher::new(director, pool));
        Ok(Self {
            config,
            state: ProxyState::new(dispatcher),
        })
    }

    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.state.dispatcher
    }

    pub async fn serve(self) -> Result<()> {
        let rpc = TcpListener::bind(self.config.server.bind_addr).await?;
        let monitor = TcpListener::bind(self.config.server.monitor_addr).await?;
        self.serve_on(rpc, monitor).await
    }

    /// Serve on already-bound listeners
    pub async fn serve_on(self, rpc: TcpListener, monitor: TcpListener) -> Result<()> {
        tracing::info!("Starting ringproxy {}", crate::VERSION);
        tracing::info!("  RPC: {}", rpc.local_addr()?);
        tracing::info!("  Monitor: {}", monitor.local_addr()?);
        tracing::info!("  Shards: {}", self.state.dispatcher.pool().len());

        let rpc_server = axum::serve(rpc, rpc_router(self.state.clone()));
        let monitor_server = axum::serve(monitor, monitor_router(self.state.clone()));

        tokio::select! {
            res = rpc_server => {
                if let Err(e) = res {
                    tracing::error!("RPC server error: {}", e);
                    return Err(Error::Io(e));
                }
            }
            res = monitor_server => {
                if let Err(e) = res {
                    tracing::error!("Monitor server error: {}", e);
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(())
    }
}
