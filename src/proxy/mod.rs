//! RPC proxy
//!
//! - Wire types (calls, NDJSON events, sinks)
//! - Positional argument schemas
//! - Dispatcher (validate → route → read-only gate → shard call)
//! - HTTP transport and monitor endpoints
//! - Server composition

pub mod dispatch;
pub mod http;
pub mod schema;
pub mod server;
pub mod wire;

pub use dispatch::{Dispatcher, RpcMethod};
pub use http::{monitor_router, rpc_router, ProxyState};
pub use schema::{ArgKind, ArgSpec};
pub use server::{connect_pool, ProxyServer};
pub use wire::{ChannelSink, RpcCall, RpcEvent, RpcSink};
