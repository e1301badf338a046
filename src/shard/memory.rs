//! In-memory shard
//!
//! Holds buckets and objects in process memory. Used for local runs and as
//! the spy backend in tests: it counts calls, can be slowed down, and can be
//! told to fail the next call of a given operation.

use crate::common::{Error, Result};
use crate::placement::Vnode;
use crate::shard::client::{BatchOp, BatchRequest, PutObject, RecordStream, ShardClient};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredBucket {
    owner: String,
    name: String,
    vnode: Vnode,
    created: String,
}

impl StoredBucket {
    fn to_json(&self) -> Value {
        json!({
            "owner": self.owner,
            "name": self.name,
            "vnode": self.vnode,
            "created": self.created,
        })
    }
}

/// Bucket records and objects are kept apart: a bucket is routed by
/// `owner:bucket` while its objects are routed by their own keys, so the two
/// usually live on different shards.
#[derive(Debug, Default)]
struct ShardState {
    buckets: HashMap<(String, String), StoredBucket>,
    objects: HashMap<(String, String), BTreeMap<String, Value>>,
    schemas: HashMap<String, Value>,
}

pub struct MemoryShard {
    pnode: String,
    state: Mutex<ShardState>,
    calls: AtomicUsize,
    latency: Duration,
    faults: Mutex<HashMap<String, VecDeque<(String, String)>>>,
}

fn bucket_not_found(owner: &str, bucket: &str) -> Error {
    Error::backend(
        "BucketNotFoundError",
        format!("{}/{} does not exist", owner, bucket),
    )
}

fn object_not_found(bucket: &str, key: &str) -> Error {
    Error::backend(
        "ObjectNotFoundError",
        format!("{}::{} does not exist", bucket, key),
    )
}

impl MemoryShard {
    pub fn new(pnode: impl Into<String>) -> Self {
        Self {
            pnode: pnode.into(),
            state: Mutex::new(ShardState::default()),
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `op` call fail with a backend error
    pub fn fail_next(&self, op: &str, name: &str, message: &str) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(op.to_string())
            .or_default()
            .push_back((name.to_string(), message.to_string()));
    }

    /// Number of calls received so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bucket schema last set through `update_bucket`
    pub fn schema(&self, bucket: &str) -> Option<Value> {
        self.lock().schemas.get(bucket).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.values().map(BTreeMap::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, op: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let fault = self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(op)
            .and_then(|queue| queue.pop_front());
        match fault {
            Some((name, message)) => Err(Error::backend(name, message)),
            None => Ok(()),
        }
    }

    fn object_record(&self, owner: &str, bucket: &str, key: &str, vnode: Vnode) -> Value {
        json!({
            "id": Uuid::new_v4().to_string(),
            "owner": owner,
            "bucket_id": bucket,
            "name": key,
            "etag": Uuid::new_v4().to_string(),
            "modified": Utc::now().to_rfc3339(),
            "vnode": vnode,
        })
    }
}

#[async_trait]
impl ShardClient for MemoryShard {
    fn pnode(&self) -> &str {
        &self.pnode
    }

    async fn create_bucket(&self, owner: &str, bucket: &str, vnode: Vnode) -> Result<Value> {
        self.enter("createBucket").await?;
        let mut state = self.lock();
        let id = (owner.to_string(), bucket.to_string());
        if state.buckets.contains_key(&id) {
            return Err(Error::backend(
                "BucketAlreadyExistsError",
                format!("{}/{} already exists", owner, bucket),
            ));
        }
        let stored = StoredBucket {
            owner: owner.to_string(),
            name: bucket.to_string(),
            vnode,
            created: Utc::now().to_rfc3339(),
        };
        let record = stored.to_json();
        state.buckets.insert(id, stored);
        Ok(record)
    }

    async fn get_bucket(&self, owner: &str, bucket: &str, _vnode: Vnode) -> Result<Value> {
        self.enter("getBucket").await?;
        self.lock()
            .buckets
            .get(&(owner.to_string(), bucket.to_string()))
            .map(StoredBucket::to_json)
            .ok_or_else(|| bucket_not_found(owner, bucket))
    }

    async fn delete_bucket(&self, owner: &str, bucket: &str, _vnode: Vnode) -> Result<Value> {
        self.enter("deleteBucket").await?;
        self.lock()
            .buckets
            .remove(&(owner.to_string(), bucket.to_string()))
            .map(|b| b.to_json())
            .ok_or_else(|| bucket_not_found(owner, bucket))
    }

    async fn update_bucket(&self, bucket: &str, config: &Value, _options: &Value) -> Result<()> {
        self.enter("updateBucket").await?;
        self.lock().schemas.insert(bucket.to_string(), config.clone());
        Ok(())
    }

    async fn put_object(&self, object: &PutObject, vnode: Vnode) -> Result<Value> {
        self.enter("putObject").await?;
        let mut record = self.object_record(&object.owner, &object.bucket, &object.key, vnode);
        let mut state = self.lock();
        let stored = state
            .objects
            .entry((object.owner.clone(), object.bucket.clone()))
            .or_default();

        // conditional put
        if let Some(expected) = object.headers.get("if-match").and_then(Value::as_str) {
            let current = stored
                .get(&object.key)
                .and_then(|o| o.get("etag"))
                .and_then(Value::as_str);
            if current != Some(expected) {
                return Err(Error::backend(
                    "EtagConflictError",
                    format!(
                        "{}::{} has etag {}, expected {}",
                        object.bucket,
                        object.key,
                        current.unwrap_or("null"),
                        expected
                    ),
                ));
            }
        }

        record["content_length"] = Value::Number(object.content_length.clone());
        record["content_md5"] = json!(object.content_md5);
        record["content_type"] = json!(object.content_type);
        record["headers"] = object.headers.clone();
        record["sharks"] = object.sharks.clone();
        record["properties"] = object.properties.clone();
        stored.insert(object.key.clone(), record.clone());
        Ok(record)
    }

    async fn get_object(
        &self,
        owner: &str,
        bucket: &str,
        key: &str,
        _vnode: Vnode,
    ) -> Result<Value> {
        self.enter("getObject").await?;
        self.lock()
            .objects
            .get(&(owner.to_string(), bucket.to_string()))
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| object_not_found(bucket, key))
    }

    async fn delete_object(
        &self,
        owner: &str,
        bucket: &str,
        key: &str,
        _vnode: Vnode,
    ) -> Result<Value> {
        self.enter("deleteObject").await?;
        self.lock()
            .objects
            .get_mut(&(owner.to_string(), bucket.to_string()))
            .and_then(|objects| objects.remove(key))
            .ok_or_else(|| object_not_found(bucket, key))
    }

    async fn batch(&self, owner: &str, requests: &[BatchRequest], vnode: Vnode) -> Result<Value> {
        self.enter("batch").await?;
        let mut state = self.lock();

        // apply in order to copies of the touched buckets; commit only if all succeed
        let mut staged: HashMap<(String, String), BTreeMap<String, Value>> = HashMap::new();
        let mut etags = Vec::with_capacity(requests.len());
        for req in requests {
            let id = (owner.to_string(), req.bucket.clone());
            let objects = staged
                .entry(id.clone())
                .or_insert_with(|| state.objects.get(&id).cloned().unwrap_or_default());
            match req.operation {
                BatchOp::Put => {
                    let mut record = self.object_record(owner, &req.bucket, &req.key, vnode);
                    record["value"] = req.value.clone();
                    etags.push(json!({
                        "bucket": req.bucket,
                        "key": req.key,
                        "etag": record["etag"].clone(),
                    }));
                    objects.insert(req.key.clone(), record);
                }
                BatchOp::Delete => {
                    if objects.remove(&req.key).is_none() {
                        return Err(object_not_found(&req.bucket, &req.key));
                    }
                    etags.push(json!({ "bucket": req.bucket, "key": req.key }));
                }
            }
        }
        state.objects.extend(staged);
        Ok(json!({ "etags": etags }))
    }

    async fn sql(
        &self,
        statement: &str,
        values: &[Value],
        _options: &Value,
    ) -> Result<RecordStream> {
        let record = match self.enter("sql").await {
            Ok(()) => Ok(json!({
                "pnode": self.pnode,
                "statement": statement,
                "values": values,
            })),
            Err(e) => Err(e),
        };
        Ok(Box::pin(futures_util::stream::iter(vec![record])))
    }
}
