//! HTTP shard client
//!
//! Talks to a shard over the same event-stream protocol the proxy serves:
//! `POST /rpc/{method}` with a JSON array of arguments, answered by
//! newline-delimited `record` / `end` / `error` events. Routed calls carry
//! the vnode as their last argument.

use crate::common::{Error, Result, WireError};
use crate::placement::Vnode;
use crate::shard::client::{BatchRequest, PutObject, RecordStream, ShardClient};
use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// One line of the response stream
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Event {
    Record { value: Value },
    End,
    Error { error: WireError },
}

fn parse_line(line: &[u8]) -> Result<Option<Event>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(line)?))
}

/// First error event in a response body, skipping lines that do not parse
fn error_event(body: &[u8]) -> Option<WireError> {
    body.split(|b| *b == b'\n')
        .find_map(|line| match parse_line(line) {
            Ok(Some(Event::Error { error })) => Some(error),
            _ => None,
        })
}

/// `tcp://host:port` → `http://host:port`
pub fn base_url(pnode: &str) -> String {
    let trimmed = pnode.trim_end_matches('/');
    match trimmed.split_once("://") {
        Some(("tcp", rest)) => format!("http://{}", rest),
        Some(_) => trimmed.to_string(),
        None => format!("http://{}", trimmed),
    }
}

pub struct HttpShardClient {
    pnode: String,
    base: String,
    client: reqwest::Client,
}

impl HttpShardClient {
    pub fn new(pnode: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            pnode: pnode.to_string(),
            base: base_url(pnode),
            client,
        })
    }

    async fn open(&self, method: &str, args: Value) -> Result<reqwest::Response> {
        let url = format!("{}/rpc/{}", self.base, method);
        tracing::debug!(pnode = %self.pnode, method, "shard call");
        let resp = self.client.post(&url).json(&args).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        // a rejected call usually still carries the shard's own error event
        let body = resp.bytes().await.unwrap_or_default();
        if let Some(error) = error_event(&body) {
            return Err(error.into_error());
        }
        Err(Error::Http(format!(
            "{} answered {} for {}",
            self.pnode, status, method
        )))
    }

    /// Call expecting at most one record
    async fn call(&self, method: &str, args: Value) -> Result<Option<Value>> {
        let body = self.open(method, args).await?.bytes().await?;
        let mut record = None;
        for line in body.split(|b| *b == b'\n') {
            match parse_line(line)? {
                Some(Event::Record { value }) => record = Some(value),
                Some(Event::End) => return Ok(record),
                Some(Event::Error { error }) => return Err(error.into_error()),
                None => {}
            }
        }
        Err(Error::Http(format!(
            "{} closed the {} stream without an end event",
            self.pnode, method
        )))
    }

    async fn call_record(&self, method: &str, args: Value) -> Result<Value> {
        self.call(method, args).await?.ok_or_else(|| {
            Error::Http(format!("{} returned no record for {}", self.pnode, method))
        })
    }
}

#[async_trait]
impl ShardClient for HttpShardClient {
    fn pnode(&self) -> &str {
        &self.pnode
    }

    async fn create_bucket(&self, owner: &str, bucket: &str, vnode: Vnode) -> Result<Value> {
        self.call_record("createBucket", json!([owner, bucket, vnode]))
            .await
    }

    async fn get_bucket(&self, owner: &str, bucket: &str, vnode: Vnode) -> Result<Value> {
        self.call_record("getBucket", json!([owner, bucket, vnode]))
            .await
    }

    async fn delete_bucket(&self, owner: &str, bucket: &str, vnode: Vnode) -> Result<Value> {
        self.call_record("deleteBucket", json!([owner, bucket, vnode]))
            .await
    }

    async fn update_bucket(&self, bucket: &str, config: &Value, options: &Value) -> Result<()> {
        self.call("updateBucket", json!([bucket, config, options]))
            .await
            .map(|_| ())
    }

    async fn put_object(&self, object: &PutObject, vnode: Vnode) -> Result<Value> {
        self.call_record(
            "putObject",
            json!([
                object.owner,
                object.bucket,
                object.key,
                object.content_length,
                object.content_md5,
                object.content_type,
                object.headers,
                object.sharks,
                object.properties,
                vnode
            ]),
        )
        .await
    }

    async fn get_object(&self, owner: &str, bucket: &str, key: &str, vnode: Vnode) -> Result<Value> {
        self.call_record("getObject", json!([owner, bucket, key, vnode]))
            .await
    }

    async fn delete_object(
        &self,
        owner: &str,
        bucket: &str,
        key: &str,
        vnode: Vnode,
    ) -> Result<Value> {
        self.call_record("deleteObject", json!([owner, bucket, key, vnode]))
            .await
    }

    async fn batch(&self, owner: &str, requests: &[BatchRequest], vnode: Vnode) -> Result<Value> {
        self.call_record("batch", json!([requests, { "owner": owner }, vnode]))
            .await
    }

    async fn sql(&self, statement: &str, values: &[Value], options: &Value) -> Result<RecordStream> {
        let resp = self
            .open("sql", json!([statement, values, options]))
            .await?;
        let pnode = self.pnode.clone();
        let mut chunks = resp.bytes_stream();

        let records = stream! {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(bytes) => buf.extend_from_slice(&bytes),
                    Err(e) => {
                        yield Err(Error::from(e));
                        return;
                    }
                }
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_line(&line[..pos]) {
                        Ok(Some(Event::Record { value })) => yield Ok(value),
                        Ok(Some(Event::End)) => return,
                        Ok(Some(Event::Error { error })) => {
                            yield Err(error.into_error());
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            match parse_line(&buf) {
                Ok(Some(Event::Record { value })) => {
                    yield Ok(value);
                    yield Err(Error::Http(format!("{} closed the sql stream early", pnode)));
                }
                Ok(Some(Event::End)) => {}
                Ok(Some(Event::Error { error })) => yield Err(error.into_error()),
                Ok(None) => yield Err(Error::Http(format!("{} closed the sql stream early", pnode))),
                Err(e) => yield Err(e),
            }
        };
        Ok(Box::pin(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("tcp://1.moray.example.com:2020"), "http://1.moray.example.com:2020");
        assert_eq!(base_url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
        assert_eq!(base_url("127.0.0.1:9000"), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_parse_events() {
        let rec = parse_line(br#"{"type":"record","value":{"a":1}}"#).unwrap();
        assert!(matches!(rec, Some(Event::Record { value }) if value["a"] == 1));
        assert!(matches!(parse_line(b"{\"type\":\"end\"}\r").unwrap(), Some(Event::End)));
        assert!(parse_line(b"   ").unwrap().is_none());

        let err = parse_line(
            br#"{"type":"error","error":{"name":"EtagConflictError","message":"stale"}}"#,
        )
        .unwrap();
        match err {
            Some(Event::Error { error }) => {
                assert_eq!(error.into_error().name(), "EtagConflictError")
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_error_event_in_rejected_body() {
        let body = b"not json\n{\"type\":\"error\",\"error\":{\"name\":\"BucketNotFoundError\",\"message\":\"b1\"}}\n";
        let error = error_event(body).unwrap();
        assert_eq!(error.name, "BucketNotFoundError");

        assert!(error_event(b"Service Unavailable").is_none());
        assert!(error_event(b"").is_none());
    }
}
