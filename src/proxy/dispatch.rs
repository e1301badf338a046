//! RPC dispatch
//!
//! A call goes through validation, routing, the read-only gate and the shard
//! call, in that order. Single-shard results get a `_node` field naming
//! where they were served from. Administrative calls go to every shard and
//! only succeed if every shard does.

use crate::common::tracing_middleware::generate_request_id;
use crate::common::{Error, Result, ShardFailure, METRICS};
use crate::placement::{DataDirector, Location};
use crate::proxy::schema::{arg, batch_requests, validate, ArgSpec};
use crate::proxy::wire::{RpcCall, RpcSink};
use crate::shard::client::{PutObject, ShardClient};
use crate::shard::ShardClientPool;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

use crate::proxy::schema::ArgKind::{Array, Number, Object, String as Str};

const BUCKET_ARGS: &[ArgSpec] = &[arg("owner", Str), arg("name", Str)];

const UPDATE_BUCKET_ARGS: &[ArgSpec] = &[
    arg("name", Str),
    arg("config", Object),
    arg("options", Object),
];

const PUT_OBJECT_ARGS: &[ArgSpec] = &[
    arg("owner", Str),
    arg("bucket_id", Str),
    arg("name", Str),
    arg("content_length", Number),
    arg("content_md5", Str),
    arg("content_type", Str),
    arg("headers", Object),
    arg("sharks", Object),
    arg("properties", Object),
];

const OBJECT_ARGS: &[ArgSpec] = &[arg("owner", Str), arg("bucket_id", Str), arg("name", Str)];

const BATCH_ARGS: &[ArgSpec] = &[arg("requests", Array), arg("options", Object)];

const SQL_ARGS: &[ArgSpec] = &[
    arg("statement", Str),
    arg("values", Array),
    arg("options", Object),
];

const DELETE_MANY_ARGS: &[ArgSpec] = &[
    arg("bucket", Str),
    arg("filter", Str),
    arg("options", Object),
];

const UPDATE_OBJECTS_ARGS: &[ArgSpec] = &[
    arg("bucket", Str),
    arg("fields", Object),
    arg("filter", Str),
    arg("options", Object),
];

const GET_TOKENS_ARGS: &[ArgSpec] = &[arg("options", Object)];

/// Every method the proxy answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    CreateBucket,
    GetBucket,
    DeleteBucket,
    UpdateBucket,
    PutObject,
    GetObject,
    DeleteObject,
    Batch,
    Sql,
    DeleteMany,
    UpdateObjects,
    GetTokens,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 12] = [
        RpcMethod::CreateBucket,
        RpcMethod::GetBucket,
        RpcMethod::DeleteBucket,
        RpcMethod::UpdateBucket,
        RpcMethod::PutObject,
        RpcMethod::GetObject,
        RpcMethod::DeleteObject,
        RpcMethod::Batch,
        RpcMethod::Sql,
        RpcMethod::DeleteMany,
        RpcMethod::UpdateObjects,
        RpcMethod::GetTokens,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::CreateBucket => "createBucket",
            RpcMethod::GetBucket => "getBucket",
            RpcMethod::DeleteBucket => "deleteBucket",
            RpcMethod::UpdateBucket => "updateBucket",
            RpcMethod::PutObject => "putObject",
            RpcMethod::GetObject => "getObject",
            RpcMethod::DeleteObject => "deleteObject",
            RpcMethod::Batch => "batch",
            RpcMethod::Sql => "sql",
            RpcMethod::DeleteMany => "deleteMany",
            RpcMethod::UpdateObjects => "updateObjects",
            RpcMethod::GetTokens => "getTokens",
        }
    }

    pub fn schema(&self) -> &'static [ArgSpec] {
        match self {
            RpcMethod::CreateBucket | RpcMethod::GetBucket | RpcMethod::DeleteBucket => {
                BUCKET_ARGS
            }
            RpcMethod::UpdateBucket => UPDATE_BUCKET_ARGS,
            RpcMethod::PutObject => PUT_OBJECT_ARGS,
            RpcMethod::GetObject | RpcMethod::DeleteObject => OBJECT_ARGS,
            RpcMethod::Batch => BATCH_ARGS,
            RpcMethod::Sql => SQL_ARGS,
            RpcMethod::DeleteMany => DELETE_MANY_ARGS,
            RpcMethod::UpdateObjects => UPDATE_OBJECTS_ARGS,
            RpcMethod::GetTokens => GET_TOKENS_ARGS,
        }
    }

    /// Mutating methods pass the read-only gate
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            RpcMethod::GetBucket | RpcMethod::GetObject | RpcMethod::GetTokens
        )
    }
}

fn str_arg<'a>(args: &'a [Value], i: usize) -> Result<&'a str> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Internal(format!("argument {} is not a string after validation", i)))
}

fn with_node(mut record: Value, location: &Location) -> Value {
    if let Some(obj) = record.as_object_mut() {
        obj.insert(
            "_node".to_string(),
            json!({ "vnode": location.vnode, "pnode": location.pnode }),
        );
    }
    record
}

pub struct Dispatcher {
    director: Arc<DataDirector>,
    pool: Arc<ShardClientPool>,
}

impl Dispatcher {
    pub fn new(director: Arc<DataDirector>, pool: Arc<ShardClientPool>) -> Self {
        Self { director, pool }
    }

    pub fn director(&self) -> &Arc<DataDirector> {
        &self.director
    }

    pub fn pool(&self) -> &Arc<ShardClientPool> {
        &self.pool
    }

    /// Run one call to completion, writing its records to `sink`.
    /// An `Err` is the call's single terminal error.
    pub async fn dispatch(&self, call: &RpcCall, sink: &mut dyn RpcSink) -> Result<()> {
        let req_id = call
            .req_id
            .clone()
            .or_else(|| call.options_req_id().map(str::to_string))
            .unwrap_or_else(generate_request_id);
        let span = tracing::info_span!("rpc", method = %call.method, req_id = %req_id);

        let start = Instant::now();
        let method = RpcMethod::parse(&call.method);
        let result = self.handle(method, call, sink).instrument(span.clone()).await;

        span.in_scope(|| match &result {
            Ok(()) => tracing::debug!(elapsed_ms = start.elapsed().as_millis() as u64, "done"),
            Err(e) => tracing::debug!(error = %e, name = e.name(), "failed"),
        });
        if let Some(method) = method {
            METRICS.record_call(method.name(), start.elapsed(), result.is_ok());
        }
        result
    }

    async fn handle(
        &self,
        method: Option<RpcMethod>,
        call: &RpcCall,
        sink: &mut dyn RpcSink,
    ) -> Result<()> {
        let method = method.ok_or_else(|| Error::UnsupportedMethod(call.method.clone()))?;
        validate(method.name(), method.schema(), &call.args)?;
        tracing::debug!(args = ?call.args, "entered");

        let args = call.args.as_slice();
        match method {
            RpcMethod::CreateBucket | RpcMethod::GetBucket | RpcMethod::DeleteBucket => {
                self.bucket_call(method, args, sink).await
            }
            RpcMethod::PutObject => self.put_object(args, sink).await,
            RpcMethod::GetObject | RpcMethod::DeleteObject => {
                self.object_call(method, args, sink).await
            }
            RpcMethod::Batch => self.batch(args, sink).await,
            RpcMethod::UpdateBucket => self.update_bucket(args).await,
            RpcMethod::Sql => self.sql(args, sink).await,
            RpcMethod::GetTokens => sink.write(json!(self.director.pnodes())).await,
            RpcMethod::DeleteMany | RpcMethod::UpdateObjects => {
                Err(Error::Unsupported("Operation not supported".into()))
            }
        }
    }

    fn gate(&self, method: RpcMethod, location: &Location) -> Result<()> {
        if method.is_mutating() && location.read_only {
            METRICS.read_only_rejections.inc();
            tracing::warn!(
                vnode = location.vnode,
                pnode = %location.pnode,
                "rejected: vnode is read-only"
            );
            return Err(Error::ReadOnly {
                pnodes: vec![location.pnode.clone()],
            });
        }
        Ok(())
    }

    /// Fan-out calls are refused outright if any shard is read-only
    fn gate_all(&self) -> Result<()> {
        let pnodes = self.director.snapshot().read_only_pnodes();
        if pnodes.is_empty() {
            return Ok(());
        }
        METRICS.read_only_rejections.inc();
        tracing::warn!(pnodes = ?pnodes, "rejected: read-only shards");
        Err(Error::ReadOnly { pnodes })
    }

    fn client_for(&self, location: &Location) -> Result<Arc<dyn ShardClient>> {
        let client = self.pool.by_pnode(&location.pnode)?;
        METRICS.record_shard_call(&location.pnode);
        tracing::debug!(vnode = location.vnode, pnode = %location.pnode, "routed");
        Ok(client)
    }

    async fn bucket_call(
        &self,
        method: RpcMethod,
        args: &[Value],
        sink: &mut dyn RpcSink,
    ) -> Result<()> {
        let owner = str_arg(args, 0)?;
        let bucket = str_arg(args, 1)?;
        let location = self.director.bucket_location(owner, bucket)?;
        self.gate(method, &location)?;

        let client = self.client_for(&location)?;
        let record = match method {
            RpcMethod::CreateBucket => client.create_bucket(owner, bucket, location.vnode).await?,
            RpcMethod::DeleteBucket => client.delete_bucket(owner, bucket, location.vnode).await?,
            _ => client.get_bucket(owner, bucket, location.vnode).await?,
        };
        sink.write(with_node(record, &location)).await
    }

    async fn put_object(&self, args: &[Value], sink: &mut dyn RpcSink) -> Result<()> {
        let object = PutObject {
            owner: str_arg(args, 0)?.to_string(),
            bucket: str_arg(args, 1)?.to_string(),
            key: str_arg(args, 2)?.to_string(),
            content_length: match &args[3] {
                Value::Number(n) => n.clone(),
                _ => return Err(Error::Internal("content_length is not a number".into())),
            },
            content_md5: str_arg(args, 4)?.to_string(),
            content_type: str_arg(args, 5)?.to_string(),
            headers: args[6].clone(),
            sharks: args[7].clone(),
            properties: args[8].clone(),
        };
        let location = self
            .director
            .object_location(&object.owner, &object.bucket, &object.key)?;
        self.gate(RpcMethod::PutObject, &location)?;

        let record = self.client_for(&location)?.put_object(&object, location.vnode).await?;
        sink.write(with_node(record, &location)).await
    }

    async fn object_call(
        &self,
        method: RpcMethod,
        args: &[Value],
        sink: &mut dyn RpcSink,
    ) -> Result<()> {
        let owner = str_arg(args, 0)?;
        let bucket = str_arg(args, 1)?;
        let key = str_arg(args, 2)?;
        let location = self.director.object_location(owner, bucket, key)?;
        self.gate(method, &location)?;

        let client = self.client_for(&location)?;
        let record = match method {
            RpcMethod::DeleteObject => {
                client.delete_object(owner, bucket, key, location.vnode).await?
            }
            _ => client.get_object(owner, bucket, key, location.vnode).await?,
        };
        sink.write(with_node(record, &location)).await
    }

    /// A batch runs on one shard, so every request must land on the same
    /// routing key.
    async fn batch(&self, args: &[Value], sink: &mut dyn RpcSink) -> Result<()> {
        let requests = batch_requests(RpcMethod::Batch.name(), &args[0])?;
        let owner = args[1].get("owner").and_then(Value::as_str).ok_or_else(|| {
            Error::InvalidArgument(
                "batch expects \"options.owner\" (args[1]) to be of type string".into(),
            )
        })?;

        let keys: Vec<String> = requests
            .iter()
            .map(|r| self.director.object_routing_key(owner, &r.bucket, &r.key))
            .collect();
        let first = keys
            .first()
            .ok_or_else(|| Error::Internal("empty batch after validation".into()))?;
        if keys.iter().any(|k| k != first) {
            tracing::debug!(keys = ?keys, "batch spans several routing keys");
            return Err(Error::Unsupported(
                "all requests must transform to the same key".into(),
            ));
        }

        let ring = self.director.snapshot();
        let location = self.director.locate_key(&ring, first)?;
        self.gate(RpcMethod::Batch, &location)?;

        let record = self
            .client_for(&location)?
            .batch(owner, &requests, location.vnode)
            .await?;
        sink.write(with_node(record, &location)).await
    }

    /// Run `op` on every shard concurrently and wait for all of them.
    /// Failures are reported in ring order, whatever order they arrive in.
    async fn fan_out<F, Fut>(&self, op: F) -> Result<()>
    where
        F: Fn(Arc<dyn ShardClient>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let clients = self.pool.all();
        let results = join_all(clients.iter().map(|(pnode, client)| {
            METRICS.record_shard_call(pnode);
            op(client.clone())
        }))
        .await;

        let failures: Vec<ShardFailure> = clients
            .into_iter()
            .zip(results)
            .filter_map(|((pnode, _), result)| {
                result.err().map(|error| ShardFailure { pnode, error })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            tracing::warn!(failed = failures.len(), "fan-out failed on some shards");
            Err(Error::Multi(failures))
        }
    }

    async fn update_bucket(&self, args: &[Value]) -> Result<()> {
        let bucket = str_arg(args, 0)?;
        let config = &args[1];
        let options = &args[2];
        self.gate_all()?;
        self.fan_out(|client| async move { client.update_bucket(bucket, config, options).await })
            .await
    }

    /// Records from all shards are interleaved as they arrive
    async fn sql(&self, args: &[Value], sink: &mut dyn RpcSink) -> Result<()> {
        let statement = str_arg(args, 0)?;
        let values = args[1].as_array().map(Vec::as_slice).unwrap_or_default();
        let options = &args[2];
        self.gate_all()?;

        let clients = self.pool.all();
        let opened = join_all(clients.iter().map(|(pnode, client)| {
            METRICS.record_shard_call(pnode);
            client.sql(statement, values, options)
        }))
        .await;

        let mut failures: Vec<(usize, ShardFailure)> = Vec::new();
        let mut streams = Vec::new();
        for (idx, ((pnode, _), opened)) in clients.into_iter().zip(opened).enumerate() {
            match opened {
                Ok(records) => {
                    streams.push(records.map(move |item| (idx, pnode.clone(), item)).boxed())
                }
                Err(error) => failures.push((idx, ShardFailure { pnode, error })),
            }
        }

        let mut merged = stream::select_all(streams);
        while let Some((idx, pnode, item)) = merged.next().await {
            match item {
                Ok(record) => sink.write(record).await?,
                Err(error) => failures.push((idx, ShardFailure { pnode, error })),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(|(idx, _)| *idx);
        tracing::warn!(failed = failures.len(), "sql failed on some shards");
        Err(Error::Multi(failures.into_iter().map(|(_, f)| f).collect()))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("director", &self.director)
            .field("pool", &self.pool)
            .finish()
    }
}
