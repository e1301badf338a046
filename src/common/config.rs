//! Configuration for ringproxy
//!
//! Loaded from an optional TOML file, then `RINGPROXY__*` environment
//! variables; the binary applies CLI overrides last.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "RINGPROXY_CONFIG";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub topology: TopologyConfig,

    #[serde(default)]
    pub shards: ShardConfig,

    /// Bucket name → key transform rule
    #[serde(default = "default_key_transforms")]
    pub key_transforms: HashMap<String, TransformRule>,

    /// Marker file written once every shard client is up
    #[serde(default = "default_readiness_file")]
    pub readiness_file: PathBuf,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_readiness_file() -> PathBuf {
    PathBuf::from("/var/tmp/ringproxy-ready")
}

fn default_key_transforms() -> HashMap<String, TransformRule> {
    HashMap::from([
        ("manta".to_string(), TransformRule::Directory),
        ("testmanta".to_string(), TransformRule::Directory),
    ])
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the RPC endpoint
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Bind address for /metrics and /status
    #[serde(default = "default_monitor_addr")]
    pub monitor_addr: SocketAddr,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2020))
}

fn default_monitor_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3020))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            monitor_addr: default_monitor_addr(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    /// Ring built from `pnodes` and `vnode_count`
    Static,
    /// Serialized ring read from `ring_path`
    File,
}

/// Where the hash ring comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_topology_kind")]
    pub source: TopologyKind,

    #[serde(default)]
    pub pnodes: Vec<String>,

    #[serde(default = "default_vnode_count")]
    pub vnode_count: u32,

    #[serde(default)]
    pub ring_path: Option<PathBuf>,

    /// Vnodes barred from writes (static source only)
    #[serde(default)]
    pub read_only_vnodes: Vec<u32>,

    /// Pnodes barred from writes (static source only)
    #[serde(default)]
    pub read_only_pnodes: Vec<String>,
}

fn default_topology_kind() -> TopologyKind {
    TopologyKind::Static
}

fn default_vnode_count() -> u32 {
    8
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            source: default_topology_kind(),
            pnodes: Vec::new(),
            vnode_count: default_vnode_count(),
            ring_path: None,
            read_only_vnodes: Vec::new(),
            read_only_pnodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardBackend {
    /// In-process shards, for local runs and tests
    Memory,
    /// Remote shards speaking the RPC event-stream protocol
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    #[serde(default = "default_shard_backend")]
    pub backend: ShardBackend,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_shard_backend() -> ShardBackend {
    ShardBackend::Http
}

fn default_request_timeout() -> u64 {
    30_000
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            backend: default_shard_backend(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl ShardConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Named key transform rules selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformRule {
    Directory,
    UuidDirectory,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            topology: TopologyConfig::default(),
            shards: ShardConfig::default(),
            key_transforms: default_key_transforms(),
            readiness_file: default_readiness_file(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `$RINGPROXY_CONFIG`) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            builder = builder.add_source(config::File::from(file.as_path()).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RINGPROXY")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("topology.pnodes")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the proxy cannot serve with.
    pub fn validate(&self) -> Result<()> {
        match self.topology.source {
            TopologyKind::Static => {
                if self.topology.pnodes.is_empty() {
                    return Err(Error::InvalidConfig(
                        "topology.pnodes must name at least one shard".into(),
                    ));
                }
                if self.topology.vnode_count == 0 {
                    return Err(Error::InvalidConfig(
                        "topology.vnode_count must be positive".into(),
                    ));
                }
                if (self.topology.vnode_count as usize) < self.topology.pnodes.len() {
                    return Err(Error::InvalidConfig(format!(
                        "topology.vnode_count ({}) must be at least the number of pnodes ({})",
                        self.topology.vnode_count,
                        self.topology.pnodes.len()
                    )));
                }
            }
            TopologyKind::File => {
                if self.topology.ring_path.is_none() {
                    return Err(Error::InvalidConfig(
                        "topology.ring_path is required for a file topology".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}
