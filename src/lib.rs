//! # ringproxy
//!
//! A sharding RPC proxy for a bucket/object metadata tier:
//! - Consistent-hash ring over SHA-256 with a fixed number of vnodes
//! - Per-bucket key transforms, so one directory lives on one shard
//! - Read-only vnodes and pnodes, refused before any shard is touched
//! - All-shard fan-out with every shard's error kept
//! - HTTP transport with newline-delimited JSON event streams
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            POST /rpc/:method
//!                   │
//!         ┌─────────▼──────────┐
//!         │     Dispatcher     │  validate → route → gate → call
//!         └───┬────────────┬───┘
//!             │            │
//!   ┌─────────▼───┐   ┌────▼─────────────┐
//!   │ DataDirector │   │ ShardClientPool  │
//!   │  HashRing    │   │  one per pnode   │
//!   └──────────────┘   └──┬──────┬─────┬──┘
//!                         │      │     │
//!                     shard 1 shard 2 shard 3
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Serve with a static ring
//! RINGPROXY__TOPOLOGY__PNODES=tcp://1.moray:2020,tcp://2.moray:2020 \
//!   ringproxy serve --bind 0.0.0.0:2020 --monitor 0.0.0.0:3020
//!
//! # Where does an object live?
//! ringproxy locate --config ringproxy.toml --owner o1 --bucket manta --key /d/x
//! ```

pub mod common;
pub mod placement;
pub mod proxy;
pub mod shard;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use placement::{DataDirector, HashRing, KeyTransform, Location};
pub use proxy::{Dispatcher, ProxyServer, RpcCall};
pub use shard::{ShardClient, ShardClientPool};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
