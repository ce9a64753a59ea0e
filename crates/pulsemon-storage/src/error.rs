use std::path::PathBuf;

/// Step of a SQL operation, used to tell which phase of a transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlPhase {
    Open,
    Begin,
    Query,
    Exec,
    Commit,
}

impl std::fmt::Display for SqlPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SqlPhase::Open => "open",
            SqlPhase::Begin => "begin",
            SqlPhase::Query => "query",
            SqlPhase::Exec => "exec",
            SqlPhase::Commit => "commit",
        };
        f.write_str(s)
    }
}

/// Errors that can occur within the storage layer.
///
/// Absence of a metric is not an error: getters return `Ok(None)`.
///
/// # Examples
///
/// ```rust
/// use pulsemon_storage::error::StorageError;
///
/// let err = StorageError::Consistency {
///     table: "gauge_metrics",
///     expected: 3,
///     affected: 2,
/// };
/// assert!(err.to_string().contains("affected 2 rows instead of 3"));
/// assert!(!err.is_persistence());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A metric name was empty after trimming.
    #[error("Storage: empty metric name")]
    EmptyName,

    /// A gauge value was NaN or infinite.
    #[error("Storage: gauge {name} must be a finite number")]
    NonFiniteGauge { name: String },

    /// Adding the delta would overflow the stored counter.
    #[error("Storage: counter {name} would overflow")]
    CounterOverflow { name: String },

    /// The engine was built without a snapshot file.
    #[error("Storage: no snapshot file configured")]
    NoSnapshotPath,

    /// Reading or writing the snapshot file failed.
    #[error("Storage: snapshot I/O on {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The snapshot write reported zero bytes.
    #[error("Storage: nothing was written to snapshot {}", path.display())]
    EmptySnapshot { path: PathBuf },

    /// The snapshot could not be encoded or decoded.
    #[error("Storage: snapshot format: {0}")]
    SnapshotFormat(#[from] serde_json::Error),

    /// The connection string is not understood.
    #[error("Storage: invalid database dsn '{0}'")]
    InvalidDsn(String),

    /// The database could not be reached at all.
    #[error("Storage: database unreachable: {0}")]
    Unreachable(rusqlite::Error),

    /// A statement or transaction step failed.
    #[error("Storage: {phase} failed on {table}: {source}")]
    Backend {
        phase: SqlPhase,
        table: &'static str,
        source: rusqlite::Error,
    },

    /// A batch touched a different number of rows than it should have; the
    /// transaction was rolled back.
    #[error("Storage: batch on {table} affected {affected} rows instead of {expected}")]
    Consistency {
        table: &'static str,
        expected: usize,
        affected: usize,
    },
}

impl StorageError {
    /// True for snapshot failures, which leave in-memory data intact and are
    /// not fatal to serving traffic.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            StorageError::Persistence { .. }
                | StorageError::EmptySnapshot { .. }
                | StorageError::SnapshotFormat(_)
                | StorageError::NoSnapshotPath
        )
    }

    pub(crate) fn backend(phase: SqlPhase, table: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| StorageError::Backend {
            phase,
            table,
            source,
        }
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
