//! Dispatcher behavior against in-memory shards

use ringproxy::placement::{directory_rule, HashRing};
use ringproxy::shard::MemoryShard;
use ringproxy::{DataDirector, Dispatcher, KeyTransform, RpcCall, ShardClient, ShardClientPool};
use serde_json::{json, Value};
use std::sync::Arc;

fn pnodes() -> Vec<String> {
    vec![
        "tcp://1.moray.example.com:2020".into(),
        "tcp://2.moray.example.com:2020".into(),
        "tcp://3.moray.example.com:2020".into(),
    ]
}

struct Harness {
    dispatcher: Dispatcher,
    shards: Vec<Arc<MemoryShard>>,
}

impl Harness {
    fn new(ring: HashRing) -> Self {
        let mut transform = KeyTransform::default();
        transform.register("b1", directory_rule);

        let shards: Vec<Arc<MemoryShard>> = ring
            .pnodes()
            .iter()
            .map(|p| Arc::new(MemoryShard::new(p.as_str())))
            .collect();
        let clients: Vec<Arc<dyn ShardClient>> = shards
            .iter()
            .map(|s| s.clone() as Arc<dyn ShardClient>)
            .collect();

        let director = Arc::new(DataDirector::new(ring, transform));
        let pool = Arc::new(ShardClientPool::from_clients(clients));
        Self {
            dispatcher: Dispatcher::new(director, pool),
            shards,
        }
    }

    fn default_ring() -> HashRing {
        HashRing::build(&pnodes(), 8).unwrap()
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> ringproxy::Result<Vec<Value>> {
        let mut out: Vec<Value> = Vec::new();
        self.dispatcher
            .dispatch(&RpcCall::new(method, args), &mut out)
            .await
            .map(|()| out)
    }

    fn backend_calls(&self) -> usize {
        self.shards.iter().map(|s| s.calls()).sum()
    }
}

fn put_args(owner: &str, bucket: &str, key: &str) -> Vec<Value> {
    vec![
        json!(owner),
        json!(bucket),
        json!(key),
        json!(11),
        json!("XrY7u+Ae7tCTyyK7j1rNww=="),
        json!("text/plain"),
        json!({ "m-color": "blue" }),
        json!([{ "datacenter": "dc1", "manta_storage_id": "1.stor" }]),
        json!({}),
    ]
}

#[tokio::test]
async fn test_crud_end_to_end() {
    let h = Harness::new(Harness::default_ring());

    let put = h.call("putObject", put_args("o1", "b1", "/d/x")).await.unwrap();
    let got = h
        .call("getObject", vec![json!("o1"), json!("b1"), json!("/d/x")])
        .await
        .unwrap();

    // computed independently of the dispatcher
    let expected = HashRing::build(&pnodes(), 8).unwrap().locate("o1:b1:/d").unwrap();

    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["_node"]["pnode"], json!(expected.pnode));
    assert_eq!(got[0]["_node"]["vnode"], json!(expected.vnode));
    assert_eq!(got[0]["etag"], put[0]["etag"]);
    assert_eq!(got[0]["content_length"], 11);
    assert_eq!(got[0]["headers"]["m-color"], "blue");

    let deleted = h
        .call("deleteObject", vec![json!("o1"), json!("b1"), json!("/d/x")])
        .await
        .unwrap();
    assert_eq!(deleted[0]["_node"], got[0]["_node"]);

    let err = h
        .call("getObject", vec![json!("o1"), json!("b1"), json!("/d/x")])
        .await
        .unwrap_err();
    assert_eq!(err.name(), "ObjectNotFoundError");
}

#[tokio::test]
async fn test_directory_siblings_share_a_shard() {
    let h = Harness::new(Harness::default_ring());
    let mut nodes = Vec::new();
    for key in ["/d/a", "/d/b", "/d/c.txt"] {
        let out = h.call("putObject", put_args("o1", "b1", key)).await.unwrap();
        nodes.push(out[0]["_node"].clone());
    }
    assert!(nodes.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_backend_errors_pass_through() {
    let h = Harness::new(Harness::default_ring());
    h.call("createBucket", vec![json!("o1"), json!("b1")]).await.unwrap();

    let err = h
        .call("createBucket", vec![json!("o1"), json!("b1")])
        .await
        .unwrap_err();
    assert_eq!(err.name(), "BucketAlreadyExistsError");

    let err = h
        .call("getBucket", vec![json!("o1"), json!("nope")])
        .await
        .unwrap_err();
    assert_eq!(err.name(), "BucketNotFoundError");

    let mut stale = put_args("o1", "b1", "/d/x");
    stale[6] = json!({ "if-match": "0000" });
    let err = h.call("putObject", stale).await.unwrap_err();
    assert_eq!(err.name(), "EtagConflictError");
}

#[tokio::test]
async fn test_validation_order() {
    let h = Harness::new(Harness::default_ring());

    // count before kinds
    let err = h.call("getObject", vec![json!(1)]).await.unwrap_err();
    assert_eq!(err.to_string(), "getObject expects 3 arguments");

    // first bad position is reported
    let err = h
        .call("getObject", vec![json!("o1"), json!(2), json!(3)])
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "getObject expects \"bucket_id\" (args[1]) to be of type string but received type number instead"
    );

    // null object
    let mut args = put_args("o1", "b1", "/d/x");
    args[8] = Value::Null;
    let err = h.call("putObject", args).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "putObject expects \"properties\" (args[8]) to be an object but received the value \"null\""
    );

    let err = h
        .call("sql", vec![json!("select 1"), json!({}), json!({})])
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "sql expects \"values\" (args[1]) to be of type array but received type object instead"
    );

    assert_eq!(h.backend_calls(), 0);
}

#[tokio::test]
async fn test_read_only_gate_never_reaches_shards() {
    let mut ring = Harness::default_ring();
    let slot = ring.locate("o1:b1:/d").unwrap();
    ring.set_read_only(&[slot.vnode], &[]).unwrap();
    let h = Harness::new(ring);

    for method in ["putObject", "deleteObject"] {
        let args = if method == "putObject" {
            put_args("o1", "b1", "/d/x")
        } else {
            vec![json!("o1"), json!("b1"), json!("/d/x")]
        };
        let err = h.call(method, args).await.unwrap_err();
        assert_eq!(err.name(), "ReadOnlyError");
        assert_eq!(
            err.to_string(),
            format!("some vnodes are in read-only mode: {}", slot.pnode)
        );
    }
    assert_eq!(h.backend_calls(), 0);

    // reads still go through
    let err = h
        .call("getObject", vec![json!("o1"), json!("b1"), json!("/d/x")])
        .await
        .unwrap_err();
    assert_eq!(err.name(), "ObjectNotFoundError");
    assert_eq!(h.backend_calls(), 1);
}

#[tokio::test]
async fn test_read_only_pnode() {
    let mut ring = Harness::default_ring();
    let slot = ring.locate("o1:b1").unwrap();
    ring.set_read_only(&[], &[slot.pnode.clone()]).unwrap();
    let h = Harness::new(ring);

    let err = h
        .call("deleteBucket", vec![json!("o1"), json!("b1")])
        .await
        .unwrap_err();
    assert_eq!(err.name(), "ReadOnlyError");
    assert_eq!(h.backend_calls(), 0);
}

fn batch_options() -> Value {
    json!({ "owner": "o1", "req_id": "7b3c6e6a-batch" })
}

#[tokio::test]
async fn test_batch_same_key() {
    let h = Harness::new(Harness::default_ring());
    h.call("putObject", put_args("o1", "b1", "/d/old")).await.unwrap();

    let out = h
        .call(
            "batch",
            vec![
                json!([
                    { "bucket": "b1", "key": "/d/new", "operation": "put", "value": { "n": 1 } },
                    { "bucket": "b1", "key": "/d/old", "operation": "delete" }
                ]),
                batch_options(),
            ],
        )
        .await
        .unwrap();

    let expected = Harness::default_ring().locate("o1:b1:/d").unwrap();
    assert_eq!(out[0]["_node"]["pnode"], json!(expected.pnode));
    assert_eq!(out[0]["etags"].as_array().unwrap().len(), 2);

    let got = h
        .call("getObject", vec![json!("o1"), json!("b1"), json!("/d/new")])
        .await
        .unwrap();
    assert_eq!(got[0]["value"], json!({ "n": 1 }));
}

#[tokio::test]
async fn test_batch_rejects_mixed_keys() {
    let h = Harness::new(Harness::default_ring());

    let err = h
        .call(
            "batch",
            vec![
                json!([
                    { "bucket": "b1", "key": "/d/x" },
                    { "bucket": "b1", "key": "/e/x" }
                ]),
                batch_options(),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.name(), "NotSupportedError");
    assert_eq!(err.to_string(), "all requests must transform to the same key");

    let err = h
        .call(
            "batch",
            vec![
                json!([{ "bucket": "b1", "key": "/d/x", "operation": "update" }]),
                batch_options(),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "\"update\" is not an allowed batch operation");

    let err = h
        .call("batch", vec![json!([]), batch_options()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("at least one request"));

    let err = h
        .call("batch", vec![json!([{ "bucket": "b1", "key": "/d/x" }]), json!({})])
        .await
        .unwrap_err();
    assert_eq!(err.name(), "InvocationError");

    assert_eq!(h.backend_calls(), 0);
}

#[tokio::test]
async fn test_batch_read_only() {
    let mut ring = Harness::default_ring();
    let slot = ring.locate("o1:b1:/d").unwrap();
    ring.set_read_only(&[slot.vnode], &[]).unwrap();
    let h = Harness::new(ring);

    let err = h
        .call(
            "batch",
            vec![json!([{ "bucket": "b1", "key": "/d/x" }]), batch_options()],
        )
        .await
        .unwrap_err();
    assert_eq!(err.name(), "ReadOnlyError");
    assert_eq!(h.backend_calls(), 0);
}

#[tokio::test]
async fn test_unsupported_method() {
    let h = Harness::new(Harness::default_ring());
    let err = h.call("findObjects", vec![]).await.unwrap_err();
    assert_eq!(err.name(), "UnsupportedMethodError");
    assert_eq!(err.to_string(), "unsupported RPC method: \"findObjects\"");
    assert_eq!(h.backend_calls(), 0);
}

#[tokio::test]
async fn test_ring_swap_between_calls() {
    let h = Harness::new(Harness::default_ring());
    let before = h
        .call("putObject", put_args("o1", "b1", "/d/x"))
        .await
        .unwrap();

    // every vnode on shard 3
    let only = vec![pnodes()[2].clone()];
    h.dispatcher
        .director()
        .install(HashRing::build(&only, 8).unwrap().with_version(2));

    let after = h
        .call("putObject", put_args("o1", "b1", "/d/x"))
        .await
        .unwrap();
    assert_eq!(after[0]["_node"]["pnode"], json!(only[0]));
    assert_eq!(before[0]["_node"]["vnode"], after[0]["_node"]["vnode"]);
}
