//! Data placement
//!
//! - Key transforms (per-bucket routing-key normalization)
//! - Consistent hash ring (SHA-256, fixed vnode count)
//! - Topology sources (static or serialized ring)
//! - Data director (owner/bucket/key → location)

pub mod director;
pub mod ring;
pub mod topology;
pub mod transform;

pub use director::{bucket_routing_key, DataDirector, Location, KEY_DELIMITER};
pub use ring::{HashRing, RingPayload, RingSlot, Vnode, RING_SCHEMA_VERSION};
pub use topology::{source_from_config, FileTopology, StaticTopology, TopologySource};
pub use transform::{directory_rule, uuid_directory_rule, KeyRule, KeyTransform};
