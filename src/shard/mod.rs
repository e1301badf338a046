//! Shards and the clients that reach them

pub mod client;
pub mod http;
pub mod memory;
pub mod pool;

pub use client::{BatchOp, BatchRequest, PutObject, RecordStream, ShardClient};
pub use http::HttpShardClient;
pub use memory::MemoryShard;
pub use pool::ShardClientPool;
