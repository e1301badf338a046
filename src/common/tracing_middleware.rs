//! Request ID propagation and request logging for the HTTP listeners
//!
//! Every request leaves this middleware with an `X-Request-ID` header, so the
//! RPC handler can tag its span with the same id the caller sees.

use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Read the request id header, if present and printable
pub fn request_id_of<B>(request: &Request<B>) -> Option<String> {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Ensure a request id on the way in, echo it and log on the way out.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response<Body> {
    let start = Instant::now();

    let request_id = request_id_of(&request).unwrap_or_else(generate_request_id);
    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &header {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;

    if let Some(value) = header {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let status = response.status();
    if status.is_success() {
        debug!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "request completed"
        );
    } else {
        warn!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "request failed"
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_id() {
        let id1 = generate_request_id();
        let id2 = generate_request_id();
        assert!(Uuid::parse_str(&id1).is_ok());
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_request_id_of() {
        let request = Request::builder()
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(())
            .unwrap();
        assert_eq!(request_id_of(&request).as_deref(), Some("abc-123"));

        let bare = Request::builder().body(()).unwrap();
        assert!(request_id_of(&bare).is_none());
    }
}
