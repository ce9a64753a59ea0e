use crate::state::AppState;
use crate::{api, logging};
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;

/// Largest request body, after decompression, any layer will buffer.
pub const MAX_REQUEST_BODY: usize = 1024 * 1024;

/// Builds the HTTP router.
///
/// Layers, outermost first: body size limit, request logging, gzip response
/// compression and request decompression, body signature. Known paths answer other methods
/// with the same 404 as unknown paths.
pub fn build_http_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::metrics_page).fallback(api::not_implemented))
        .route("/ping", get(api::ping).fallback(api::not_implemented))
        .route(
            "/update/{kind}/{name}/{value}",
            post(api::update_text).fallback(api::not_implemented),
        )
        .route(
            "/value/{kind}/{name}",
            get(api::value_text).fallback(api::not_implemented),
        )
        .route(
            "/update",
            post(api::update_json).fallback(api::not_implemented),
        )
        .route(
            "/value",
            post(api::value_json).fallback(api::not_implemented),
        )
        .route(
            "/updates",
            post(api::update_batch).fallback(api::not_implemented),
        )
        .fallback(api::not_implemented)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::signature,
        ))
        .layer(CompressionLayer::new())
        .layer(RequestDecompressionLayer::new())
        .with_state(state)
        .layer(middleware::from_fn(logging::request_logging))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY))
}
