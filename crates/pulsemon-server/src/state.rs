use crate::config::StorageConfig;
use pulsemon_storage::{
    MemStorage, MemStorageOptions, MetricStorage, SaveMode, SqlStorage, StorageError,
};
use std::sync::Arc;
use std::time::Duration;

/// The storage backend chosen at startup.
///
/// The memory variant is kept concrete so the server can drive its snapshot
/// schedule and take a final snapshot at shutdown.
#[derive(Clone)]
pub enum Backend {
    Memory(Arc<MemStorage>),
    Sql(Arc<SqlStorage>),
}

impl Backend {
    pub fn storage(&self) -> Arc<dyn MetricStorage> {
        match self {
            Backend::Memory(mem) => Arc::clone(mem) as Arc<dyn MetricStorage>,
            Backend::Sql(sql) => Arc::clone(sql) as Arc<dyn MetricStorage>,
        }
    }

    pub fn memory(&self) -> Option<&Arc<MemStorage>> {
        match self {
            Backend::Memory(mem) => Some(mem),
            Backend::Sql(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Memory(mem) => mem.backend(),
            Backend::Sql(sql) => sql.backend(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn MetricStorage>,
    pub hash_key: Option<Arc<String>>,
}

impl AppState {
    pub fn new(storage: Arc<dyn MetricStorage>, hash_key: Option<&str>) -> Self {
        Self {
            storage,
            hash_key: hash_key
                .filter(|k| !k.is_empty())
                .map(|k| Arc::new(k.to_string())),
        }
    }
}

/// Builds the backend described by `config`.
///
/// A database that cannot be opened or pinged is not fatal: the server falls
/// back to the in-memory backend. A reachable database whose schema cannot be
/// prepared is fatal. A snapshot that cannot be restored is logged and the
/// server starts empty.
///
/// Blocking; call from a blocking context.
pub fn init_storage(config: &StorageConfig) -> Result<Backend, StorageError> {
    if let Some(dsn) = config.database_dsn.as_deref() {
        match SqlStorage::connect(dsn) {
            Ok(sql) => {
                let created = sql.init_schema()?;
                if !created.is_empty() {
                    tracing::info!(tables = ?created, "Created metric tables");
                }
                tracing::info!(backend = sql.backend(), "Storage ready");
                return Ok(Backend::Sql(Arc::new(sql)));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Database not available, falling back to in-memory storage");
            }
        }
    }

    let mem = MemStorage::new(MemStorageOptions {
        snapshot_path: config.file_storage_path.clone(),
        save_mode: SaveMode::from_interval(Duration::from_secs(config.store_interval_secs)),
    });

    if config.restore {
        if let Some(path) = config.file_storage_path.as_deref().filter(|p| p.exists()) {
            match mem.restore(path) {
                Ok(()) => tracing::info!(path = %path.display(), "Restored metrics snapshot"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to restore snapshot, starting empty")
                }
            }
        }
    }

    tracing::info!(backend = mem.backend(), save_mode = ?mem.save_mode(), "Storage ready");
    Ok(Backend::Memory(Arc::new(mem)))
}
