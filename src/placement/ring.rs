//! Consistent hash ring
//!
//! The hash space `[0, max]` is cut into `vnode_count` intervals of
//! `vnode_hash_interval` each; every vnode belongs to exactly one pnode.
//! A key is placed by hashing it with SHA-256 and dividing the full 256-bit
//! digest by the interval. The division is done on big integers: truncating
//! the digest to a machine word would send writes and reads of one object to
//! different shards.

use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// The only ring schema this proxy understands
pub const RING_SCHEMA_VERSION: &str = "1.0.0";

pub const SHA256: &str = "sha256";

/// Index of a virtual node
pub type Vnode = u32;

/// Where a key landed on the ring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSlot {
    pub vnode: Vnode,
    pub pnode: String,
}

/// Hash parameters, hex encoded on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    pub name: String,
    pub max: String,
    pub vnode_hash_interval: String,
}

/// Serialized ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingPayload {
    pub schema_version: String,
    pub algorithm: AlgorithmSpec,
    pub vnode_count: u32,
    pub pnodes: Vec<String>,
    pub vnode_to_pnode: BTreeMap<Vnode, String>,
    pub pnode_to_vnodes: BTreeMap<String, Vec<Vnode>>,
    #[serde(default)]
    pub read_only_vnodes: Vec<Vnode>,
    #[serde(default)]
    pub read_only_pnodes: Vec<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

/// Immutable ring snapshot
#[derive(Debug, Clone)]
pub struct HashRing {
    max: BigUint,
    interval: BigUint,
    vnode_count: u32,
    pnodes: Vec<String>,
    /// vnode → index into `pnodes`
    owners: Vec<usize>,
    pnode_to_vnodes: BTreeMap<String, BTreeSet<Vnode>>,
    read_only_vnodes: HashSet<Vnode>,
    read_only_pnodes: HashSet<String>,
    version: u64,
    time: Option<DateTime<Utc>>,
}

fn sha256_max() -> BigUint {
    BigUint::from_bytes_be(&[0xff; 32])
}

fn parse_hex(field: &str, value: &str) -> Result<BigUint> {
    BigUint::parse_bytes(value.as_bytes(), 16)
        .ok_or_else(|| Error::InvalidConfig(format!("ring {} is not a hex number: {:?}", field, value)))
}

impl HashRing {
    /// Build a fresh ring, assigning vnodes to pnodes round-robin.
    pub fn build(pnodes: &[String], vnode_count: u32) -> Result<Self> {
        if pnodes.is_empty() {
            return Err(Error::InvalidConfig("a ring needs at least one pnode".into()));
        }
        if (vnode_count as usize) < pnodes.len() {
            return Err(Error::InvalidConfig(format!(
                "{} vnodes cannot cover {} pnodes",
                vnode_count,
                pnodes.len()
            )));
        }
        let unique: HashSet<&String> = pnodes.iter().collect();
        if unique.len() != pnodes.len() {
            return Err(Error::InvalidConfig("duplicate pnode in ring".into()));
        }

        let max = sha256_max();
        let interval = &max / BigUint::from(vnode_count);
        let owners: Vec<usize> = (0..vnode_count as usize).map(|v| v % pnodes.len()).collect();

        let mut pnode_to_vnodes: BTreeMap<String, BTreeSet<Vnode>> = BTreeMap::new();
        for (vnode, &owner) in owners.iter().enumerate() {
            pnode_to_vnodes
                .entry(pnodes[owner].clone())
                .or_default()
                .insert(vnode as Vnode);
        }

        Ok(Self {
            max,
            interval,
            vnode_count,
            pnodes: pnodes.to_vec(),
            owners,
            pnode_to_vnodes,
            read_only_vnodes: HashSet::new(),
            read_only_pnodes: HashSet::new(),
            version: 0,
            time: Some(Utc::now()),
        })
    }

    /// Rebuild a ring from its serialized form, checking it is well formed.
    pub fn from_payload(payload: &RingPayload) -> Result<Self> {
        if payload.schema_version != RING_SCHEMA_VERSION {
            return Err(Error::InvalidConfig(format!(
                "unsupported ring schema version: {}",
                payload.schema_version
            )));
        }
        if payload.algorithm.name != SHA256 {
            return Err(Error::InvalidConfig(format!(
                "unsupported ring algorithm: {}",
                payload.algorithm.name
            )));
        }
        let max = parse_hex("max", &payload.algorithm.max)?;
        let interval = parse_hex("vnode_hash_interval", &payload.algorithm.vnode_hash_interval)?;
        if interval == BigUint::from(0u32) {
            return Err(Error::InvalidConfig("ring vnode_hash_interval is zero".into()));
        }
        if payload.vnode_count == 0 || payload.pnodes.is_empty() {
            return Err(Error::InvalidConfig("ring has no vnodes or no pnodes".into()));
        }
        if max != sha256_max() {
            return Err(Error::InvalidConfig(format!(
                "ring max {} is not the sha256 hash space",
                payload.algorithm.max
            )));
        }
        // vnode_count intervals must tile the space, up to the truncation tail
        if interval != &max / BigUint::from(payload.vnode_count) {
            return Err(Error::InvalidConfig(format!(
                "ring vnode_hash_interval {} does not split the hash space into {} vnodes",
                payload.algorithm.vnode_hash_interval, payload.vnode_count
            )));
        }

        let index: BTreeMap<&str, usize> = payload
            .pnodes
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_str(), i))
            .collect();
        if index.len() != payload.pnodes.len() {
            return Err(Error::InvalidConfig("duplicate pnode in ring".into()));
        }

        let mut owners = Vec::with_capacity(payload.vnode_count as usize);
        for vnode in 0..payload.vnode_count {
            let pnode = payload.vnode_to_pnode.get(&vnode).ok_or_else(|| {
                Error::InvalidConfig(format!("vnode {} has no owner", vnode))
            })?;
            let owner = index.get(pnode.as_str()).ok_or_else(|| {
                Error::InvalidConfig(format!("vnode {} owned by unknown pnode {}", vnode, pnode))
            })?;
            owners.push(*owner);
        }
        if payload.vnode_to_pnode.len() != payload.vnode_count as usize {
            return Err(Error::InvalidConfig(
                "vnode_to_pnode names vnodes outside the ring".into(),
            ));
        }

        // the inverse map must agree exactly with the forward map
        let mut pnode_to_vnodes: BTreeMap<String, BTreeSet<Vnode>> = BTreeMap::new();
        for (vnode, &owner) in owners.iter().enumerate() {
            pnode_to_vnodes
                .entry(payload.pnodes[owner].clone())
                .or_default()
                .insert(vnode as Vnode);
        }
        for pnode in &payload.pnodes {
            let derived = pnode_to_vnodes.get(pnode);
            let declared: Option<BTreeSet<Vnode>> = payload
                .pnode_to_vnodes
                .get(pnode)
                .map(|v| v.iter().copied().collect());
            match (derived, declared) {
                (Some(derived), Some(declared)) if *derived == declared => {}
                (None, _) => {
                    return Err(Error::InvalidConfig(format!("pnode {} owns no vnodes", pnode)))
                }
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "pnode_to_vnodes disagrees with vnode_to_pnode for {}",
                        pnode
                    )))
                }
            }
        }
        if payload.pnode_to_vnodes.len() != payload.pnodes.len() {
            return Err(Error::InvalidConfig(
                "pnode_to_vnodes names pnodes outside the ring".into(),
            ));
        }

        let mut ring = Self {
            max,
            interval,
            vnode_count: payload.vnode_count,
            pnodes: payload.pnodes.clone(),
            owners,
            pnode_to_vnodes,
            read_only_vnodes: HashSet::new(),
            read_only_pnodes: HashSet::new(),
            version: payload.version,
            time: payload.time,
        };
        ring.set_read_only(&payload.read_only_vnodes, &payload.read_only_pnodes)?;
        Ok(ring)
    }

    pub fn to_payload(&self) -> RingPayload {
        let mut read_only_vnodes: Vec<Vnode> = self.read_only_vnodes.iter().copied().collect();
        read_only_vnodes.sort_unstable();
        let mut read_only_pnodes: Vec<String> = self.read_only_pnodes.iter().cloned().collect();
        read_only_pnodes.sort();

        RingPayload {
            schema_version: RING_SCHEMA_VERSION.to_string(),
            algorithm: AlgorithmSpec {
                name: SHA256.to_string(),
                max: self.max.to_str_radix(16),
                vnode_hash_interval: self.interval.to_str_radix(16),
            },
            vnode_count: self.vnode_count,
            pnodes: self.pnodes.clone(),
            vnode_to_pnode: self
                .owners
                .iter()
                .enumerate()
                .map(|(v, &o)| (v as Vnode, self.pnodes[o].clone()))
                .collect(),
            pnode_to_vnodes: self
                .pnode_to_vnodes
                .iter()
                .map(|(p, vs)| (p.clone(), vs.iter().copied().collect()))
                .collect(),
            read_only_vnodes,
            read_only_pnodes,
            version: self.version,
            time: self.time,
        }
    }

    /// Flag vnodes and pnodes as barred from writes.
    pub fn set_read_only(&mut self, vnodes: &[Vnode], pnodes: &[String]) -> Result<()> {
        if let Some(v) = vnodes.iter().find(|&&v| v >= self.vnode_count) {
            return Err(Error::InvalidConfig(format!("read-only vnode {} is not in the ring", v)));
        }
        if let Some(p) = pnodes.iter().find(|p| !self.pnode_to_vnodes.contains_key(*p)) {
            return Err(Error::InvalidConfig(format!("read-only pnode {} is not in the ring", p)));
        }
        self.read_only_vnodes = vnodes.iter().copied().collect();
        self.read_only_pnodes = pnodes.iter().cloned().collect();
        Ok(())
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Vnode owning `key`'s digest.
    pub fn vnode_for(&self, key: &str) -> Result<Vnode> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("cannot place an empty routing key".into()));
        }
        let digest = Sha256::digest(key.as_bytes());
        let value = BigUint::from_bytes_be(&digest);
        let quotient = value / &self.interval;

        // interval is max / count truncated; the sliver above count * interval
        // belongs to the last vnode
        let vnode = match u32::try_from(&quotient) {
            Ok(v) if v < self.vnode_count => v,
            Ok(v) if v == self.vnode_count => v - 1,
            _ => {
                tracing::error!(
                    key,
                    quotient = %quotient,
                    vnode_count = self.vnode_count,
                    "ring: digest falls outside every vnode"
                );
                return Err(Error::RoutingInvariant(format!(
                    "key {:?} hashed to vnode {} of {}",
                    key, quotient, self.vnode_count
                )));
            }
        };

        tracing::trace!(key, digest = %hex::encode(digest), vnode, "ring: hashed key");
        Ok(vnode)
    }

    /// Place `key` on the ring
    pub fn locate(&self, key: &str) -> Result<RingSlot> {
        let vnode = self.vnode_for(key)?;
        let pnode = self.pnode_of(vnode)?;
        Ok(RingSlot {
            vnode,
            pnode: pnode.to_string(),
        })
    }

    pub fn pnode_of(&self, vnode: Vnode) -> Result<&str> {
        self.owners
            .get(vnode as usize)
            .map(|&owner| self.pnodes[owner].as_str())
            .ok_or_else(|| {
                tracing::error!(vnode, vnode_count = self.vnode_count, "ring: vnode has no owner");
                Error::RoutingInvariant(format!("vnode {} is not in the ring", vnode))
            })
    }

    pub fn pnodes(&self) -> &[String] {
        &self.pnodes
    }

    /// Vnodes owned by `pnode`, ascending; empty for an unknown pnode.
    pub fn vnodes_of(&self, pnode: &str) -> Vec<Vnode> {
        self.pnode_to_vnodes
            .get(pnode)
            .map(|vs| vs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_vnode_read_only(&self, vnode: Vnode) -> bool {
        self.read_only_vnodes.contains(&vnode)
    }

    pub fn is_pnode_read_only(&self, pnode: &str) -> bool {
        self.read_only_pnodes.contains(pnode)
    }

    /// Write-barred if either the vnode or its owner is flagged
    pub fn is_read_only(&self, slot: &RingSlot) -> bool {
        self.is_vnode_read_only(slot.vnode) || self.is_pnode_read_only(&slot.pnode)
    }

    /// Pnodes that cannot take writes, in ring order
    pub fn read_only_pnodes(&self) -> Vec<String> {
        self.pnodes
            .iter()
            .filter(|p| {
                self.is_pnode_read_only(p)
                    || self
                        .vnodes_of(p)
                        .iter()
                        .any(|v| self.is_vnode_read_only(*v))
            })
            .cloned()
            .collect()
    }

    pub fn vnode_count(&self) -> u32 {
        self.vnode_count
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pnodes(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("tcp://{}.moray:2020", i)).collect()
    }

    #[test]
    fn test_interval_matches_serialized_rings() {
        let ring = HashRing::build(&pnodes(2), 8).unwrap();
        let payload = ring.to_payload();
        assert_eq!(payload.algorithm.max, "f".repeat(64));
        assert_eq!(
            payload.algorithm.vnode_hash_interval,
            format!("1{}", "f".repeat(63))
        );
    }

    #[test]
    fn test_locate_deterministic() {
        let ring = HashRing::build(&pnodes(3), 64).unwrap();
        let first = ring.locate("o1:b1:/d").unwrap();
        for _ in 0..10 {
            assert_eq!(ring.locate("o1:b1:/d").unwrap(), first);
        }
    }

    #[test]
    fn test_vnode_uses_full_digest() {
        let ring = HashRing::build(&pnodes(2), 8).unwrap();
        // the top three bits of the digest select one of 8 vnodes
        for key in ["a", "b", "owner:bucket", "o1:b1:/d", "z".repeat(300).as_str()] {
            let digest = Sha256::digest(key.as_bytes());
            assert_eq!(ring.vnode_for(key).unwrap(), (digest[0] >> 5) as u32, "key {}", key);
        }
    }

    #[test]
    fn test_top_of_hash_space_lands_on_last_vnode() {
        let ring = HashRing::build(&pnodes(2), 8).unwrap();
        let quotient = sha256_max() / &ring.interval;
        assert_eq!(quotient, BigUint::from(8u32));
        // clamped, never out of range
        for i in 0..500 {
            assert!(ring.vnode_for(&format!("key-{}", i)).unwrap() < 8);
        }
    }

    #[test]
    fn test_payload_with_mismatched_interval_rejected() {
        let ring = HashRing::build(&pnodes(2), 8).unwrap();

        let mut payload = ring.to_payload();
        payload.algorithm.vnode_hash_interval = (sha256_max() / 16u32).to_str_radix(16);
        assert!(matches!(HashRing::from_payload(&payload), Err(Error::InvalidConfig(_))));

        let mut payload = ring.to_payload();
        payload.algorithm.vnode_hash_interval = (sha256_max() / 4u32).to_str_radix(16);
        assert!(HashRing::from_payload(&payload).is_err());

        let mut payload = ring.to_payload();
        payload.algorithm.max = "f".repeat(32);
        assert!(HashRing::from_payload(&payload).is_err());
    }

    #[test]
    fn test_quotient_past_last_vnode_is_invariant_violation() {
        let mut ring = HashRing::build(&pnodes(2), 8).unwrap();
        ring.interval = sha256_max() / 16u32;

        let mut violations = 0;
        for i in 0..200 {
            match ring.vnode_for(&format!("key-{}", i)) {
                Ok(v) => assert!(v < 8),
                Err(Error::RoutingInvariant(_)) => violations += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(violations > 0);
    }

    #[test]
    fn test_empty_key_rejected() {
        let ring = HashRing::build(&pnodes(1), 4).unwrap();
        assert!(matches!(ring.locate(""), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_partition_complete_and_disjoint() {
        let ring = HashRing::build(&pnodes(3), 100).unwrap();
        let mut seen = BTreeSet::new();
        for p in ring.pnodes() {
            let owned = ring.vnodes_of(p);
            assert!(!owned.is_empty());
            for v in owned {
                assert!(seen.insert(v), "vnode {} owned twice", v);
                assert_eq!(ring.pnode_of(v).unwrap(), p);
            }
        }
        assert_eq!(seen, (0..100).collect::<BTreeSet<_>>());
    }

    #[test]
    fn test_unknown_vnode_is_invariant_violation() {
        let ring = HashRing::build(&pnodes(2), 8).unwrap();
        assert!(matches!(ring.pnode_of(8), Err(Error::RoutingInvariant(_))));
    }

    #[test]
    fn test_payload_roundtrip_preserves_placement() {
        let mut ring = HashRing::build(&pnodes(2), 16).unwrap();
        ring.set_read_only(&[3], &[]).unwrap();
        let json = serde_json::to_string(&ring.to_payload()).unwrap();
        let payload: RingPayload = serde_json::from_str(&json).unwrap();
        let restored = HashRing::from_payload(&payload).unwrap();

        for key in ["x", "o1:b1", "o1:b1:/d"] {
            assert_eq!(ring.locate(key).unwrap(), restored.locate(key).unwrap());
        }
        assert!(restored.is_vnode_read_only(3));
    }

    #[test]
    fn test_payload_with_inconsistent_maps_rejected() {
        let ring = HashRing::build(&pnodes(2), 8).unwrap();

        let mut payload = ring.to_payload();
        payload.pnode_to_vnodes.get_mut(&pnodes(2)[0]).unwrap().push(1);
        assert!(HashRing::from_payload(&payload).is_err());

        let mut payload = ring.to_payload();
        payload.vnode_to_pnode.remove(&5);
        assert!(HashRing::from_payload(&payload).is_err());

        let mut payload = ring.to_payload();
        payload.algorithm.name = "md5".into();
        assert!(HashRing::from_payload(&payload).is_err());

        let mut payload = ring.to_payload();
        payload.schema_version = "2.0.0".into();
        assert!(HashRing::from_payload(&payload).is_err());
    }

    #[test]
    fn test_pnode_without_vnodes_rejected() {
        let ring = HashRing::build(&pnodes(2), 8).unwrap();
        let mut payload = ring.to_payload();
        payload.pnodes.push("tcp://3.moray:2020".into());
        assert!(HashRing::from_payload(&payload).is_err());
    }

    #[test]
    fn test_read_only_flags() {
        let mut ring = HashRing::build(&pnodes(2), 8).unwrap();
        ring.set_read_only(&[2], &[pnodes(2)[1].clone()]).unwrap();

        let slot0 = RingSlot { vnode: 0, pnode: pnodes(2)[0].clone() };
        let slot2 = RingSlot { vnode: 2, pnode: pnodes(2)[0].clone() };
        let slot1 = RingSlot { vnode: 1, pnode: pnodes(2)[1].clone() };
        assert!(!ring.is_read_only(&slot0));
        assert!(ring.is_read_only(&slot2));
        assert!(ring.is_read_only(&slot1));
        assert_eq!(ring.read_only_pnodes(), pnodes(2));

        assert!(ring.set_read_only(&[8], &[]).is_err());
        assert!(ring.set_read_only(&[], &["tcp://nope:1".into()]).is_err());
    }
}
