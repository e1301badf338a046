//! HTTP surface
//!
//! - `POST /rpc/:method`: JSON array of arguments in, NDJSON events out
//! - Monitor listener: `/metrics`, `/status`, `/health`

use crate::common::tracing_middleware::{request_id_middleware, request_id_of};
use crate::common::{Error, METRICS};
use crate::proxy::dispatch::Dispatcher;
use crate::proxy::wire::{ChannelSink, RpcCall, RpcEvent};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const NDJSON: &str = "application/x-ndjson";

/// Buffered events per in-flight call
const EVENT_BUFFER: usize = 64;

/// Largest accepted argument array, in bytes
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
    pub start_time: DateTime<Utc>,
}

impl ProxyState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            start_time: Utc::now(),
        }
    }
}

pub fn rpc_router(state: ProxyState) -> Router {
    Router::new()
        .route("/rpc/:method", post(rpc))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

pub fn monitor_router(state: ProxyState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

fn ndjson(status: StatusCode, body: Body) -> Response {
    (status, [(header::CONTENT_TYPE, NDJSON)], body).into_response()
}

/// Run the call on its own task and stream its events back as they come.
async fn rpc(State(state): State<ProxyState>, Path(method): Path<String>, request: Request) -> Response {
    let req_id = request_id_of(&request);
    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            let err = Error::InvalidArgument(format!(
                "unable to read request body (limit {} bytes): {}",
                MAX_BODY_BYTES, e
            ));
            return ndjson(StatusCode::BAD_REQUEST, Body::from(RpcEvent::error(&err).to_line()));
        }
    };
    let args = match parse_args(&body) {
        Ok(args) => args,
        Err(err) => {
            return ndjson(StatusCode::BAD_REQUEST, Body::from(RpcEvent::error(&err).to_line()))
        }
    };

    let mut call = RpcCall::new(method, args);
    call.req_id = req_id;

    let (tx, rx) = mpsc::channel::<RpcEvent>(EVENT_BUFFER);
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx.clone());
        let terminal = match state.dispatcher.dispatch(&call, &mut sink).await {
            Ok(()) => RpcEvent::End,
            Err(e) => RpcEvent::error(&e),
        };
        if tx.send(terminal).await.is_err() {
            tracing::debug!(method = %call.method, "caller went away before the end of the call");
        }
    });

    let events = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_line()));
    ndjson(StatusCode::OK, Body::from_stream(events))
}

fn parse_args(body: &Bytes) -> Result<Vec<Value>, Error> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_slice(body)? {
        Value::Array(args) => Ok(args),
        other => Err(Error::InvalidArgument(format!(
            "RPC arguments must be a JSON array, got {}",
            crate::proxy::schema::observed_kind(&other)
        ))),
    }
}

async fn metrics(State(state): State<ProxyState>) -> impl IntoResponse {
    let ring = state.dispatcher.director().snapshot();
    let mut out = METRICS.to_prometheus();
    out += &format!("ringproxy_ring_version {}\n", ring.version());
    out += &format!("ringproxy_ring_vnodes {}\n", ring.vnode_count());
    out += &format!("ringproxy_ring_pnodes {}\n", ring.pnodes().len());
    out += &format!(
        "ringproxy_ring_read_only_pnodes {}\n",
        ring.read_only_pnodes().len()
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
}

async fn status(State(state): State<ProxyState>) -> impl IntoResponse {
    let ring = state.dispatcher.director().snapshot();
    axum::Json(json!({
        "pid": std::process::id(),
        "start_time": state.start_time.to_rfc3339(),
        "client_list": state.dispatcher.pool().pnodes(),
        "topology": {
            "version": ring.version(),
            "vnode_count": ring.vnode_count(),
            "pnodes": ring.pnodes(),
            "read_only_pnodes": ring.read_only_pnodes(),
            "time": ring.time().map(|t| t.to_rfc3339()),
        },
    }))
}

async fn health(State(state): State<ProxyState>) -> impl IntoResponse {
    let shards = state.dispatcher.pool().len();
    let code = if shards > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        axum::Json(json!({
            "status": if shards > 0 { "healthy" } else { "no shards" },
            "shards": shards,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(&Bytes::from_static(b"")).unwrap(), Vec::<Value>::new());
        assert_eq!(
            parse_args(&Bytes::from_static(br#"["o1", {"a": 1}]"#)).unwrap(),
            vec![json!("o1"), json!({"a": 1})]
        );

        let err = parse_args(&Bytes::from_static(br#"{"owner": "o1"}"#)).unwrap_err();
        assert_eq!(err.name(), "InvocationError");
        assert!(parse_args(&Bytes::from_static(b"[1,")).is_err());
    }
}
