use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use pulsemon_common::types::{
    format_gauge, validate_name, Metric, MetricBatch, MetricKind, MetricValue, ValidationError,
};
use pulsemon_storage::{MetricStorage, MetricsListing, StorageError};
use serde::de::DeserializeOwned;
use std::fmt::Write;

/// Errors a handler can answer with. Every variant renders as plain text.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("wrong Content-Type. Expect application/json")]
    NotJson,

    #[error("failed unmarshal body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("metric {0} not found")]
    NotFound(String),

    #[error("{0}")]
    Storage(#[from] StorageError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::NotJson | AppError::Body(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Storage(
                StorageError::EmptyName
                | StorageError::NonFiniteGauge { .. }
                | StorageError::CounterOverflow { .. },
            ) => StatusCode::BAD_REQUEST,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}

type ApiResult<T> = Result<T, AppError>;

/// Accepts a completed write whose follow-up snapshot failed: the value is
/// stored, so the request still succeeds.
fn written(result: Result<(), StorageError>, what: &str) -> ApiResult<()> {
    match result {
        Err(e) if e.is_persistence() => {
            tracing::warn!(metric = %what, error = %e, "Metric stored but snapshot failed");
            Ok(())
        }
        other => Ok(other?),
    }
}

fn put(storage: &dyn MetricStorage, name: &str, value: MetricValue) -> ApiResult<()> {
    let result = match value {
        MetricValue::Gauge(v) => storage.put_gauge(name, v),
        MetricValue::Counter(d) => storage.put_counter(name, d),
    };
    written(result, name)
}

/// Current value as a wire metric, or `NotFound`.
fn current(storage: &dyn MetricStorage, kind: MetricKind, name: &str) -> ApiResult<Metric> {
    let metric = match kind {
        MetricKind::Gauge => storage.get_gauge(name)?.map(|v| Metric::gauge(name, v)),
        MetricKind::Counter => storage.get_counter(name)?.map(|d| Metric::counter(name, d)),
    };
    metric.ok_or_else(|| AppError::NotFound(name.to_string()))
}

fn parse_json<T: DeserializeOwned>(headers: &HeaderMap, body: &[u8]) -> ApiResult<T> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(AppError::NotJson);
    }
    Ok(serde_json::from_slice(body)?)
}

/// GET / : every metric as an HTML page.
pub async fn metrics_page(State(state): State<AppState>) -> ApiResult<Html<String>> {
    let listing = state.storage.get_all()?;
    Ok(Html(render_page(&listing)))
}

/// GET /ping
pub async fn ping(State(state): State<AppState>) -> Response {
    match state.storage.ping() {
        Ok(()) => (StatusCode::OK, "pong").into_response(),
        Err(e) => {
            tracing::error!(backend = state.storage.backend(), error = %e, "Storage ping failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// POST /update/{kind}/{name}/{value}
pub async fn update_text(
    State(state): State<AppState>,
    Path((kind, name, raw)): Path<(String, String, String)>,
) -> ApiResult<String> {
    let kind: MetricKind = kind.parse()?;
    let name = validate_name(&name)?;
    let value = MetricValue::parse(kind, &raw)?;
    put(state.storage.as_ref(), name, value)?;
    Ok(format!("metric {name} saved"))
}

/// GET /value/{kind}/{name}
pub async fn value_text(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> ApiResult<String> {
    let kind: MetricKind = kind.parse()?;
    let name = validate_name(&name)?;
    let text = match kind {
        MetricKind::Gauge => state.storage.get_gauge(name)?.map(format_gauge),
        MetricKind::Counter => state.storage.get_counter(name)?.map(|d| d.to_string()),
    };
    text.ok_or_else(|| AppError::NotFound(name.to_string()))
}

/// POST /update : one JSON metric; answers with its stored value.
pub async fn update_json(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Metric>> {
    let metric: Metric = parse_json(&headers, &body)?;
    let name = metric.name()?;
    let value = metric.metric_value()?;
    put(state.storage.as_ref(), name, value)?;
    Ok(Json(current(state.storage.as_ref(), value.kind(), name)?))
}

/// POST /value : JSON `{id, type}`; answers with the stored metric.
pub async fn value_json(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Metric>> {
    let query: Metric = parse_json(&headers, &body)?;
    let kind = query.kind()?;
    let name = query.name()?;
    Ok(Json(current(state.storage.as_ref(), kind, name)?))
}

/// POST /updates : a JSON list of metrics, stored as one counter batch and
/// one gauge batch. Answers with the stored value of every name touched.
pub async fn update_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Vec<Metric>>> {
    let metrics: Vec<Metric> = parse_json(&headers, &body)?;
    let batch = MetricBatch::from_metrics(&metrics)?;
    let storage = state.storage.as_ref();

    if !batch.counters.is_empty() {
        written(storage.put_counters(&batch.counters), "counter batch")?;
    }
    if !batch.gauges.is_empty() {
        written(storage.put_gauges(&batch.gauges), "gauge batch")?;
    }
    tracing::debug!(
        gauges = batch.gauges.len(),
        counters = batch.counters.len(),
        "Stored metric batch"
    );

    let mut gauges: Vec<_> = batch.gauges.keys().collect();
    gauges.sort();
    let mut counters: Vec<_> = batch.counters.keys().collect();
    counters.sort();

    let mut stored = Vec::with_capacity(batch.len());
    for name in gauges {
        stored.push(current(storage, MetricKind::Gauge, name)?);
    }
    for name in counters {
        stored.push(current(storage, MetricKind::Counter, name)?);
    }
    Ok(Json(stored))
}

/// Anything not routed above.
pub async fn not_implemented() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not implemented yet")
}

const PAGE_STYLE: &str = "div.metrics { display: flex; } \
div.metrics div { padding: 0 20px; } \
table { width: 100%; border: 1px solid #dddddd; border-collapse: collapse; } \
table td { border: 1px solid #dddddd; padding: 5px; }";

fn render_page(listing: &MetricsListing) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>pulsemon</title>",
    );
    let _ = write!(html, "<style>{PAGE_STYLE}</style></head>\n<body>\n<h1>METRICS</h1>\n");
    html.push_str("<div class=\"metrics\">\n");
    render_table(&mut html, "Gauge", &listing.gauges);
    render_table(&mut html, "Counter", &listing.counters);
    html.push_str("</div>\n</body>\n</html>\n");
    html
}

fn render_table<'a>(
    html: &mut String,
    title: &str,
    rows: impl IntoIterator<Item = (&'a String, &'a String)>,
) {
    let _ = write!(html, "<div>\n<h3>{title}</h3>\n<table>\n");
    let mut empty = true;
    for (name, value) in rows {
        empty = false;
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td></tr>",
            escape(name),
            escape(value)
        );
    }
    if empty {
        html.push_str("<tr><td>no metrics</td></tr>\n");
    }
    html.push_str("</table>\n</div>\n");
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
