//! Data director: routing of (owner, bucket[, key]) onto the current ring
//!
//! The director owns the active ring as an immutable snapshot behind a single
//! lock-protected `Arc`. Each lookup takes one snapshot, so a concurrent
//! `install` is observed either entirely or not at all.

use crate::common::{Error, Result};
use crate::placement::ring::{HashRing, RingSlot, Vnode};
use crate::placement::topology::TopologySource;
use crate::placement::transform::KeyTransform;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Separator between routing key components
pub const KEY_DELIMITER: char = ':';

/// Result of a routing lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub vnode: Vnode,
    pub pnode: String,
    #[serde(skip)]
    pub read_only: bool,
}

pub fn bucket_routing_key(owner: &str, bucket: &str) -> String {
    format!("{}{}{}", owner, KEY_DELIMITER, bucket)
}

pub struct DataDirector {
    ring: RwLock<Arc<HashRing>>,
    transform: KeyTransform,
}

impl DataDirector {
    pub fn new(ring: HashRing, transform: KeyTransform) -> Self {
        Self {
            ring: RwLock::new(Arc::new(ring)),
            transform,
        }
    }

    /// Resolve the ring version, then fetch and validate that ring.
    /// Any failing stage aborts with a single `Topology` error.
    pub async fn init(source: &dyn TopologySource, transform: KeyTransform) -> Result<Self> {
        let version = source.resolve_version().await.map_err(|e| Error::Topology {
            stage: "resolve version",
            source: Box::new(e),
        })?;
        tracing::debug!(%version, "dataDirector: resolved ring version");

        let payload = source.fetch_ring(&version).await.map_err(|e| Error::Topology {
            stage: "fetch ring",
            source: Box::new(e),
        })?;

        let ring = HashRing::from_payload(&payload).map_err(|e| Error::Topology {
            stage: "load ring",
            source: Box::new(e),
        })?;

        tracing::info!(
            %version,
            ring_version = ring.version(),
            vnodes = ring.vnode_count(),
            pnodes = ring.pnodes().len(),
            "dataDirector: initialized"
        );
        Ok(Self::new(ring, transform))
    }

    /// Current ring snapshot
    pub fn snapshot(&self) -> Arc<HashRing> {
        self.ring
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publish a new ring; in-flight lookups keep the snapshot they took.
    pub fn install(&self, ring: HashRing) {
        let ring = Arc::new(ring);
        tracing::info!(ring_version = ring.version(), "dataDirector: installing ring");
        *self.ring.write().unwrap_or_else(|e| e.into_inner()) = ring;
    }

    pub fn transform(&self) -> &KeyTransform {
        &self.transform
    }

    pub fn object_routing_key(&self, owner: &str, bucket: &str, key: &str) -> String {
        format!(
            "{}{}{}{}{}",
            owner,
            KEY_DELIMITER,
            bucket,
            KEY_DELIMITER,
            self.transform.transform(bucket, key)
        )
    }

    pub fn bucket_location(&self, owner: &str, bucket: &str) -> Result<Location> {
        let key = bucket_routing_key(owner, bucket);
        self.locate_key(&self.snapshot(), &key)
    }

    pub fn object_location(&self, owner: &str, bucket: &str, key: &str) -> Result<Location> {
        let tkey = self.object_routing_key(owner, bucket, key);
        tracing::debug!(owner, bucket, key, tkey = %tkey, "dataDirector: key transformed");
        self.locate_key(&self.snapshot(), &tkey)
    }

    /// Locate an already-built routing key on a given snapshot
    pub fn locate_key(&self, ring: &HashRing, routing_key: &str) -> Result<Location> {
        let slot: RingSlot = ring.locate(routing_key)?;
        let read_only = ring.is_read_only(&slot);
        Ok(Location {
            vnode: slot.vnode,
            pnode: slot.pnode,
            read_only,
        })
    }

    pub fn pnodes(&self) -> Vec<String> {
        self.snapshot().pnodes().to_vec()
    }

    pub fn vnodes(&self, pnode: &str) -> Vec<Vnode> {
        self.snapshot().vnodes_of(pnode)
    }
}

impl std::fmt::Debug for DataDirector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.snapshot();
        f.debug_struct("DataDirector")
            .field("ring_version", &ring.version())
            .field("vnodes", &ring.vnode_count())
            .field("pnodes", &ring.pnodes())
            .field("transform", &self.transform)
            .finish()
    }
}
