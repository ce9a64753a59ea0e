#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Request, StatusCode};
use pulsemon_server::app;
use pulsemon_server::state::AppState;
use pulsemon_storage::{MemStorage, MemStorageOptions, MetricStorage, SaveMode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub struct TestContext {
    pub temp_dir: TempDir,
    pub storage: Arc<MemStorage>,
    pub state: AppState,
    pub app: axum::Router,
}

pub fn build_test_context() -> TestContext {
    build_with(None, SaveMode::Periodic(Duration::from_secs(300)))
}

pub fn build_signed_context(key: &str) -> TestContext {
    build_with(Some(key), SaveMode::Periodic(Duration::from_secs(300)))
}

pub fn build_with(key: Option<&str>, save_mode: SaveMode) -> TestContext {
    let temp_dir = tempfile::tempdir().expect("temp dir should be created");
    let storage = Arc::new(MemStorage::new(MemStorageOptions {
        snapshot_path: Some(temp_dir.path().join("metrics-db.json")),
        save_mode,
    }));
    let state = AppState::new(storage.clone() as Arc<dyn MetricStorage>, key);
    let app = app::build_http_app(state.clone());
    TestContext {
        temp_dir,
        storage,
        state,
        app,
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("response should be JSON")
    }
}

pub async fn send(app: &axum::Router, req: Request<Body>) -> TestResponse {
    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should be handled");
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read")
        .to_vec();
    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn request_no_body(app: &axum::Router, method: &str, uri: &str) -> TestResponse {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    send(app, req).await
}

pub async fn request_json(app: &axum::Router, uri: &str, body: Value) -> TestResponse {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build");
    send(app, req).await
}
