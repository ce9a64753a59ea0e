//! Latest-value storage for gauges and counters.
//!
//! Two backends implement [`MetricStorage`]: the in-memory
//! [`memory::MemStorage`], which can persist itself to a JSON snapshot file,
//! and the relational [`sqlite::SqlStorage`]. The server picks one at
//! startup and only talks to the trait afterwards.

pub mod error;
pub mod memory;
pub mod snapshot;
pub mod sqlite;


use std::collections::{BTreeMap, HashMap};

pub use error::{Result, StorageError};
pub use memory::{MemStorage, MemStorageOptions, SaveMode};
pub use sqlite::SqlStorage;

/// Persistence backend for the latest value of every metric.
///
/// Implementations must be safe to share across threads (`Send + Sync`):
/// every inbound request calls into the storage concurrently, plus at most
/// one background snapshot task. Operations on the same metric name are
/// linearizable; nothing is promised across names.
pub trait MetricStorage: Send + Sync {
    /// Short name of the backend, for diagnostics.
    fn backend(&self) -> &'static str;

    /// Current gauge value, or `None` if the gauge was never written.
    fn get_gauge(&self, name: &str) -> Result<Option<f64>>;

    /// Replaces the gauge value.
    fn put_gauge(&self, name: &str, value: f64) -> Result<()>;

    /// Current counter value, or `None` if the counter was never written.
    fn get_counter(&self, name: &str) -> Result<Option<i64>>;

    /// Adds `delta` to the counter, creating it at `delta` when absent.
    fn put_counter(&self, name: &str, delta: i64) -> Result<()>;

    /// Replaces every gauge in `batch`. Either all entries are applied or an
    /// error is returned and none are.
    fn put_gauges(&self, batch: &HashMap<String, f64>) -> Result<()>;

    /// Adds every delta in `batch` to its counter, all or nothing.
    fn put_counters(&self, batch: &HashMap<String, i64>) -> Result<()>;

    /// Every current value rendered as text, partitioned by kind.
    fn get_all(&self) -> Result<MetricsListing>;

    /// Succeeds when the backing store is reachable.
    fn ping(&self) -> Result<()>;
}

/// Textual listing of all metrics, ordered by name within each kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsListing {
    pub gauges: BTreeMap<String, String>,
    pub counters: BTreeMap<String, String>,
}

impl MetricsListing {
    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty() && self.counters.is_empty()
    }
}

pub(crate) fn check_name(name: &str) -> Result<()> {
    pulsemon_common::types::validate_name(name)
        .map(|_| ())
        .map_err(|_| StorageError::EmptyName)
}

/// Snapshots and the relational columns only hold finite gauges.
pub(crate) fn check_gauge(name: &str, value: f64) -> Result<()> {
    check_name(name)?;
    if !value.is_finite() {
        return Err(StorageError::NonFiniteGauge {
            name: name.to_string(),
        });
    }
    Ok(())
}
