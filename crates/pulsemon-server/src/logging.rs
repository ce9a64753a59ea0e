use axum::body::{to_bytes, Body, Bytes};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;
use std::fmt;
use std::time::Instant;

use crate::middleware::buffer_request;

static TRACE_HEADER: header::HeaderName = header::HeaderName::from_static("x-trace-id");

/// Per-request id shared by the request and response log lines and echoed
/// in `X-Trace-Id`. Stored in request extensions for inner layers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceId(u64);

impl TraceId {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

const PREVIEW_CHARS: usize = 200;

/// Leading text of a body for the log line.
fn preview(bytes: &[u8]) -> String {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return format!("<{} bytes binary>", bytes.len());
    };
    let mut chars = text.char_indices();
    match chars.nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Uncompressed JSON or text, which is worth echoing into the log.
fn is_readable(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json") || ct.starts_with("text/plain"))
}

/// Responses are produced by this server, so they are read unbounded.
async fn buffer_response(body: Body) -> Bytes {
    to_bytes(body, usize::MAX).await.unwrap_or_default()
}

fn log_response(trace_id: &TraceId, status: StatusCode, elapsed_us: u64, size: usize, body: &str) {
    let status = status.as_u16();
    match status {
        500.. => tracing::error!(%trace_id, status, elapsed_us, size, body, "<-- response"),
        400..=499 => tracing::warn!(%trace_id, status, elapsed_us, size, body, "<-- response"),
        _ => tracing::info!(%trace_id, status, elapsed_us, size, "<-- response"),
    }
}

/// Logs each request and its response under one trace id.
///
/// Request bodies are included when readable; response bodies only for
/// JSON answers and error statuses.
pub async fn request_logging(mut req: Request, next: Next) -> Response {
    let trace_id = TraceId::generate();
    req.extensions_mut().insert(trace_id.clone());
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let req = if is_readable(req.headers()) {
        let (parts, bytes) = match buffer_request(req).await {
            Ok(buffered) => buffered,
            Err(mut rejection) => {
                let status = rejection.status().as_u16();
                tracing::warn!(%trace_id, %method, %path, status, "--> request body rejected");
                if let Ok(value) = HeaderValue::from_str(&trace_id.to_string()) {
                    rejection.headers_mut().insert(TRACE_HEADER.clone(), value);
                }
                return rejection;
            }
        };
        tracing::info!(%trace_id, %method, %path, body = %preview(&bytes), "--> request");
        Request::from_parts(parts, Body::from(bytes))
    } else {
        tracing::info!(%trace_id, %method, %path, "--> request");
        req
    };

    let started = Instant::now();
    let response = next.run(req).await;
    let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

    let (mut parts, body) = response.into_parts();
    let bytes = buffer_response(body).await;
    let shown = if parts.status.is_client_error()
        || parts.status.is_server_error()
        || is_readable(&parts.headers)
    {
        preview(&bytes)
    } else {
        String::new()
    };
    log_response(&trace_id, parts.status, elapsed_us, bytes.len(), &shown);

    if let Ok(value) = HeaderValue::from_str(&trace_id.to_string()) {
        parts.headers.insert(TRACE_HEADER.clone(), value);
    }
    Response::from_parts(parts, Body::from(bytes))
}
