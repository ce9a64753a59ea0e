use anyhow::Result;
use pulsemon_server::app;
use pulsemon_server::config::ServerConfig;
use pulsemon_server::saver::{self, SnapshotSaver};
use pulsemon_server::state::{self, AppState, Backend};
use pulsemon_storage::SaveMode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  pulsemon-server [config.toml]    Start the server");
    eprintln!();
    eprintln!("Environment overrides: ADDRESS, STORE_INTERVAL, FILE_STORAGE_PATH, RESTORE, DATABASE_DSN, KEY");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pulsemon=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        path => run_server(ServerConfig::resolve(path)?).await,
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let storage_config = config.storage.clone();
    let backend = tokio::task::spawn_blocking(move || state::init_storage(&storage_config)).await??;

    let token = CancellationToken::new();
    let saver_handle = match backend.memory() {
        Some(mem) if mem.snapshot_path().is_some() => match mem.save_mode() {
            SaveMode::Periodic(every) => {
                Some(SnapshotSaver::new(mem.clone(), every).spawn(token.clone()))
            }
            SaveMode::Inline => None,
        },
        _ => None,
    };

    let state = AppState::new(backend.storage(), config.signing_key());
    let app = app::build_http_app(state);
    let listener = tokio::net::TcpListener::bind(&config.address).await?;

    tracing::info!(
        address = %config.address,
        backend = backend.name(),
        signing = config.signing_key().is_some(),
        "Server started"
    );

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            signal::ctrl_c().await.ok();
            tracing::info!("Shutting down gracefully");
        })
        .await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server error");
    }

    token.cancel();
    if let Some(handle) = saver_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Snapshot saver task failed");
        }
    }
    final_snapshot(&backend).await;

    tracing::info!("Server stopped");
    result.map_err(Into::into)
}

async fn final_snapshot(backend: &Backend) {
    let Some(mem) = backend.memory() else {
        return;
    };
    if mem.snapshot_path().is_none() {
        return;
    }
    match saver::save_now(mem).await {
        Ok(()) => tracing::info!("Final snapshot saved"),
        Err(e) => tracing::error!(error = %e, "Final snapshot failed"),
    }
}
