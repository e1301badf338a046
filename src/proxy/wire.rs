//! RPC call and response-stream types

use crate::common::{Error, Result, WireError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// An incoming call: method name and positional arguments
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub method: String,
    pub args: Vec<Value>,
    /// Request id supplied by the transport, if any
    pub req_id: Option<String>,
}

impl RpcCall {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            req_id: None,
        }
    }

    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = Some(req_id.into());
        self
    }

    /// `req_id` from the call's trailing options object
    pub fn options_req_id(&self) -> Option<&str> {
        self.args
            .last()
            .and_then(|opts| opts.get("req_id"))
            .and_then(Value::as_str)
    }
}

/// One line of the response stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcEvent {
    Record { value: Value },
    End,
    Error { error: WireError },
}

impl RpcEvent {
    pub fn error(err: &Error) -> Self {
        RpcEvent::Error {
            error: err.to_wire(),
        }
    }

    /// NDJSON line, newline included
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            // only reachable with non-string map keys, which Value never has
            format!(
                r#"{{"type":"error","error":{{"name":"SerializationError","message":"{}"}}}}"#,
                e
            )
        });
        line.push('\n');
        line
    }
}

/// Where a dispatched call writes its records
#[async_trait]
pub trait RpcSink: Send {
    async fn write(&mut self, record: Value) -> Result<()>;
}

#[async_trait]
impl RpcSink for Vec<Value> {
    async fn write(&mut self, record: Value) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Forwards records to a response stream
pub struct ChannelSink {
    tx: mpsc::Sender<RpcEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RpcEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl RpcSink for ChannelSink {
    async fn write(&mut self, record: Value) -> Result<()> {
        self.tx
            .send(RpcEvent::Record { value: record })
            .await
            .map_err(|_| Error::Internal("caller went away mid-response".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_lines() {
        assert_eq!(RpcEvent::End.to_line(), "{\"type\":\"end\"}\n");

        let line = RpcEvent::Record { value: json!({"k": 1}) }.to_line();
        let back: RpcEvent = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(back, RpcEvent::Record { value: json!({"k": 1}) });

        let line = RpcEvent::error(&Error::UnsupportedMethod("frob".into())).to_line();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["error"]["name"], "UnsupportedMethodError");
        assert_eq!(v["error"]["message"], "unsupported RPC method: \"frob\"");
    }

    #[test]
    fn test_options_req_id() {
        let call = RpcCall::new("getObject", vec![json!("o1"), json!({"req_id": "abc"})]);
        assert_eq!(call.options_req_id(), Some("abc"));
        assert_eq!(RpcCall::new("getTokens", vec![]).options_req_id(), None);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = ChannelSink::new(tx);
        sink.write(json!(1)).await.unwrap();
        assert_eq!(rx.recv().await, Some(RpcEvent::Record { value: json!(1) }));

        drop(rx);
        assert!(sink.write(json!(2)).await.is_err());
    }
}
