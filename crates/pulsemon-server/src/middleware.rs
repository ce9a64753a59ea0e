use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{FromRequest, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use pulsemon_common::sign;

use crate::logging::TraceId;
use crate::state::AppState;

/// `HashSHA256`, in the lowercase form header maps store.
static HASH_HEADER: HeaderName = HeaderName::from_static("hashsha256");

/// Verifies and produces `HashSHA256` body signatures.
///
/// Only active when a key is configured. Requests to any path but `/` must
/// carry the hex SHA-256 of key and body; every response gets the same
/// signature over its own body.
pub async fn signature(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(key) = state.hash_key.clone() else {
        return next.run(req).await;
    };

    let trace_id = req
        .extensions()
        .get::<TraceId>()
        .map(ToString::to_string)
        .unwrap_or_default();

    let req = if req.uri().path() == "/" {
        req
    } else {
        let Some(expected) = req
            .headers()
            .get(&HASH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
        else {
            tracing::warn!(trace_id = %trace_id, "Request rejected: missing body hash header");
            return (StatusCode::BAD_REQUEST, "absent body hash header").into_response();
        };

        let (parts, bytes) = match buffer_request(req).await {
            Ok(buffered) => buffered,
            Err(rejection) => {
                let status = rejection.status().as_u16();
                tracing::warn!(trace_id = %trace_id, status, "Request rejected: body not readable");
                return rejection;
            }
        };
        if !sign::verify(&bytes, &key, &expected) {
            tracing::warn!(trace_id = %trace_id, "Request rejected: body hash mismatch");
            return (StatusCode::BAD_REQUEST, "hashes not equal").into_response();
        }
        Request::from_parts(parts, Body::from(bytes))
    };

    let response = next.run(req).await;
    let (mut parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();
    if let Ok(val) = HeaderValue::from_str(&sign::sign(&bytes, &key)) {
        parts.headers.insert(HASH_HEADER.clone(), val);
    }
    Response::from_parts(parts, Body::from(bytes))
}

/// Reads the whole request body, bounded by the router's `DefaultBodyLimit`.
///
/// A body over the limit is answered with 413, any other read failure
/// (such as corrupt gzip) with 400.
pub(crate) async fn buffer_request(req: Request) -> Result<(Parts, Bytes), Response> {
    let (parts, body) = req.into_parts();
    let bytes = Bytes::from_request(Request::from_parts(parts.clone(), body), &())
        .await
        .map_err(IntoResponse::into_response)?;
    Ok((parts, bytes))
}
