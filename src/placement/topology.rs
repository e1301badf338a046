//! Topology sources
//!
//! Loading a ring takes two steps: resolve which ring schema version is
//! current, then fetch the ring for that version. A placement service would
//! slot in behind the same trait.

use crate::common::{Config, Error, Result, TopologyKind};
use crate::placement::ring::{HashRing, RingPayload, Vnode, RING_SCHEMA_VERSION};
use async_trait::async_trait;
use std::path::PathBuf;

#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Ring schema version currently published
    async fn resolve_version(&self) -> Result<String>;

    /// Full ring payload for `version`
    async fn fetch_ring(&self, version: &str) -> Result<RingPayload>;
}

fn check_version(version: &str) -> Result<()> {
    if version == RING_SCHEMA_VERSION {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "Invalid data placement version: {}",
            version
        )))
    }
}

/// Ring built in-process from a pnode list
#[derive(Debug, Clone)]
pub struct StaticTopology {
    pnodes: Vec<String>,
    vnode_count: u32,
    read_only_vnodes: Vec<Vnode>,
    read_only_pnodes: Vec<String>,
}

impl StaticTopology {
    pub fn new(pnodes: Vec<String>, vnode_count: u32) -> Self {
        Self {
            pnodes,
            vnode_count,
            read_only_vnodes: Vec::new(),
            read_only_pnodes: Vec::new(),
        }
    }

    pub fn with_read_only(mut self, vnodes: Vec<Vnode>, pnodes: Vec<String>) -> Self {
        self.read_only_vnodes = vnodes;
        self.read_only_pnodes = pnodes;
        self
    }
}

#[async_trait]
impl TopologySource for StaticTopology {
    async fn resolve_version(&self) -> Result<String> {
        Ok(RING_SCHEMA_VERSION.to_string())
    }

    async fn fetch_ring(&self, version: &str) -> Result<RingPayload> {
        check_version(version)?;
        let mut ring = HashRing::build(&self.pnodes, self.vnode_count)?;
        ring.set_read_only(&self.read_only_vnodes, &self.read_only_pnodes)?;
        Ok(ring.to_payload())
    }
}

/// Serialized ring stored as JSON on disk
#[derive(Debug, Clone)]
pub struct FileTopology {
    path: PathBuf,
}

impl FileTopology {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<RingPayload> {
        let raw = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl TopologySource for FileTopology {
    async fn resolve_version(&self) -> Result<String> {
        Ok(self.read().await?.schema_version)
    }

    async fn fetch_ring(&self, version: &str) -> Result<RingPayload> {
        check_version(version)?;
        let payload = self.read().await?;
        if payload.schema_version != version {
            return Err(Error::InvalidConfig(format!(
                "ring file {} changed version while loading ({} != {})",
                self.path.display(),
                payload.schema_version,
                version
            )));
        }
        Ok(payload)
    }
}

/// The source named by configuration
pub fn source_from_config(config: &Config) -> Result<Box<dyn TopologySource>> {
    let topology = &config.topology;
    match topology.source {
        TopologyKind::Static => Ok(Box::new(
            StaticTopology::new(topology.pnodes.clone(), topology.vnode_count).with_read_only(
                topology.read_only_vnodes.clone(),
                topology.read_only_pnodes.clone(),
            ),
        )),
        TopologyKind::File => {
            let path = topology.ring_path.clone().ok_or_else(|| {
                Error::InvalidConfig("topology.ring_path is required for a file topology".into())
            })?;
            Ok(Box::new(FileTopology::new(path)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_topology() {
        let source = StaticTopology::new(vec!["tcp://a:2020".into(), "tcp://b:2020".into()], 8)
            .with_read_only(vec![1], vec![]);
        let version = source.resolve_version().await.unwrap();
        assert_eq!(version, RING_SCHEMA_VERSION);

        let payload = source.fetch_ring(&version).await.unwrap();
        assert_eq!(payload.vnode_count, 8);
        assert_eq!(payload.read_only_vnodes, vec![1]);
        assert!(source.fetch_ring("0.9.0").await.is_err());
    }

    #[tokio::test]
    async fn test_file_topology() {
        let ring = HashRing::build(&["tcp://a:2020".to_string()], 4).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_vec(&ring.to_payload()).unwrap()).unwrap();

        let source = FileTopology::new(file.path());
        let version = source.resolve_version().await.unwrap();
        let payload = source.fetch_ring(&version).await.unwrap();
        assert_eq!(payload.pnodes, vec!["tcp://a:2020".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let source = FileTopology::new("/nonexistent/ring.json");
        assert!(matches!(source.resolve_version().await, Err(Error::Io(_))));
    }
}
