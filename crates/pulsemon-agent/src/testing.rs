use pulsemon_server::app::build_http_app;
use pulsemon_server::state::AppState;
use pulsemon_storage::{MemStorage, MemStorageOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A pulsemon server on an ephemeral local port, backed by memory.
pub struct TestServer {
    pub storage: Arc<MemStorage>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(key: Option<&str>) -> Self {
        let storage = Arc::new(MemStorage::new(MemStorageOptions::default()));
        let app = build_http_app(AppState::new(storage.clone(), key));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            storage,
            addr,
            handle,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
