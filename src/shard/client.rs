//! The shard client contract
//!
//! A shard is an independent bucket/object store. The proxy only ever talks
//! to it through this trait; responses are the shard's own JSON records.

use crate::common::Result;
use crate::placement::Vnode;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Records streamed back by a shard
pub type RecordStream = BoxStream<'static, Result<Value>>;

/// Everything `putObject` carries besides routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutObject {
    pub owner: String,
    pub bucket: String,
    pub key: String,
    pub content_length: serde_json::Number,
    pub content_md5: String,
    pub content_type: String,
    pub headers: Value,
    pub sharks: Value,
    pub properties: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOp {
    Put,
    Delete,
}

impl BatchOp {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "put" => Some(BatchOp::Put),
            "delete" => Some(BatchOp::Delete),
            _ => None,
        }
    }
}

/// One validated element of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub bucket: String,
    pub key: String,
    pub operation: BatchOp,
    #[serde(default)]
    pub value: Value,
}

#[async_trait]
pub trait ShardClient: Send + Sync {
    /// Address of the shard this client talks to
    fn pnode(&self) -> &str;

    async fn create_bucket(&self, owner: &str, bucket: &str, vnode: Vnode) -> Result<Value>;

    async fn get_bucket(&self, owner: &str, bucket: &str, vnode: Vnode) -> Result<Value>;

    async fn delete_bucket(&self, owner: &str, bucket: &str, vnode: Vnode) -> Result<Value>;

    /// Bucket schema change applied to every shard
    async fn update_bucket(&self, bucket: &str, config: &Value, options: &Value) -> Result<()>;

    async fn put_object(&self, object: &PutObject, vnode: Vnode) -> Result<Value>;

    async fn get_object(&self, owner: &str, bucket: &str, key: &str, vnode: Vnode)
        -> Result<Value>;

    async fn delete_object(
        &self,
        owner: &str,
        bucket: &str,
        key: &str,
        vnode: Vnode,
    ) -> Result<Value>;

    /// Apply all requests on this shard as one unit
    async fn batch(&self, owner: &str, requests: &[BatchRequest], vnode: Vnode) -> Result<Value>;

    async fn sql(&self, statement: &str, values: &[Value], options: &Value)
        -> Result<RecordStream>;
}
