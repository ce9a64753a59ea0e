use crate::snapshot::{self, Snapshot};
use crate::{check_gauge, check_name, MetricStorage, MetricsListing, Result, StorageError};
use pulsemon_common::types::format_gauge;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

pub const BACKEND: &str = "in-memory";

/// When the engine writes its snapshot file. Chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// A background task calls [`MemStorage::save`] on this cadence.
    Periodic(Duration),
    /// Every successful put saves before returning.
    Inline,
}

impl SaveMode {
    /// A zero interval means inline saving.
    pub fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            SaveMode::Inline
        } else {
            SaveMode::Periodic(interval)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemStorageOptions {
    pub snapshot_path: Option<PathBuf>,
    pub save_mode: SaveMode,
}

impl Default for MemStorageOptions {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            save_mode: SaveMode::Periodic(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Default)]
struct MetricState {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

/// In-memory engine: two mappings behind one reader/writer lock.
///
/// Counter accumulation is a read-modify-write under the write lock, so
/// concurrent puts to the same counter are never lost. Batches are applied
/// under a single write-lock acquisition.
pub struct MemStorage {
    state: RwLock<MetricState>,
    // Serialises snapshot writers so they share one temp file safely and
    // finish in the order their state was captured.
    save_lock: Mutex<()>,
    snapshot_path: Option<PathBuf>,
    save_mode: SaveMode,
}

impl MemStorage {
    pub fn new(options: MemStorageOptions) -> Self {
        Self {
            state: RwLock::new(MetricState::default()),
            save_lock: Mutex::new(()),
            snapshot_path: options.snapshot_path,
            save_mode: options.save_mode,
        }
    }

    pub fn save_mode(&self) -> SaveMode {
        self.save_mode
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Lock for reading, recovering from a poisoned lock if necessary.
    fn read(&self) -> RwLockReadGuard<'_, MetricState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MetricState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Point-in-time copy of the whole state.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.read();
        Snapshot {
            gauges: state
                .gauges
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            counters: state
                .counters
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Writes the snapshot to the configured file.
    pub fn save(&self) -> Result<()> {
        let path = self
            .snapshot_path
            .as_deref()
            .ok_or(StorageError::NoSnapshotPath)?;
        self.save_to(path)
    }

    /// Writes the snapshot to `path`. The read lock is held only while the
    /// state is copied; encoding and file I/O happen outside it.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let _guard = self
            .save_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let bytes = self.snapshot().encode()?;
        snapshot::write_atomic(path, &bytes)
    }

    /// Replaces the whole state with the snapshot stored at `path`.
    ///
    /// Meant for startup, before the engine is shared. On error the current
    /// state is left untouched.
    pub fn restore(&self, path: &Path) -> Result<()> {
        let snap = Snapshot::read_from(path)?;
        self.load(snap);
        Ok(())
    }

    /// Replaces the whole state with `snap`.
    pub fn load(&self, snap: Snapshot) {
        let mut state = self.write();
        state.gauges = snap.gauges.into_iter().collect();
        state.counters = snap.counters.into_iter().collect();
    }

    fn after_write(&self) -> Result<()> {
        match (self.save_mode, &self.snapshot_path) {
            (SaveMode::Inline, Some(path)) => self.save_to(path),
            _ => Ok(()),
        }
    }
}

impl MetricStorage for MemStorage {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn get_gauge(&self, name: &str) -> Result<Option<f64>> {
        Ok(self.read().gauges.get(name).copied())
    }

    fn put_gauge(&self, name: &str, value: f64) -> Result<()> {
        check_gauge(name, value)?;
        self.write().gauges.insert(name.to_string(), value);
        self.after_write()
    }

    fn get_counter(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.read().counters.get(name).copied())
    }

    fn put_counter(&self, name: &str, delta: i64) -> Result<()> {
        check_name(name)?;
        {
            let mut state = self.write();
            let current = state.counters.get(name).copied().unwrap_or(0);
            let next = current
                .checked_add(delta)
                .ok_or_else(|| StorageError::CounterOverflow {
                    name: name.to_string(),
                })?;
            state.counters.insert(name.to_string(), next);
        }
        self.after_write()
    }

    fn put_gauges(&self, batch: &HashMap<String, f64>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        for (name, value) in batch {
            check_gauge(name, *value)?;
        }
        {
            let mut state = self.write();
            for (name, value) in batch {
                state.gauges.insert(name.clone(), *value);
            }
        }
        self.after_write()
    }

    fn put_counters(&self, batch: &HashMap<String, i64>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        for name in batch.keys() {
            check_name(name)?;
        }
        {
            let mut state = self.write();
            let mut updated = Vec::with_capacity(batch.len());
            for (name, delta) in batch {
                let current = state.counters.get(name).copied().unwrap_or(0);
                let next = current
                    .checked_add(*delta)
                    .ok_or_else(|| StorageError::CounterOverflow { name: name.clone() })?;
                updated.push((name.clone(), next));
            }
            state.counters.extend(updated);
        }
        self.after_write()
    }

    fn get_all(&self) -> Result<MetricsListing> {
        let state = self.read();
        Ok(MetricsListing {
            gauges: state
                .gauges
                .iter()
                .map(|(k, v)| (k.clone(), format_gauge(*v)))
                .collect(),
            counters: state
                .counters
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
        })
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn inline_storage(dir: &TempDir) -> MemStorage {
        MemStorage::new(MemStorageOptions {
            snapshot_path: Some(dir.path().join("metrics.json")),
            save_mode: SaveMode::Inline,
        })
    }

    #[test]
    fn save_mode_from_zero_interval_is_inline() {
        assert_eq!(SaveMode::from_interval(Duration::ZERO), SaveMode::Inline);
        assert_eq!(
            SaveMode::from_interval(Duration::from_secs(5)),
            SaveMode::Periodic(Duration::from_secs(5))
        );
    }

    #[test]
    fn concurrent_counter_puts_lose_nothing() {
        let storage = Arc::new(MemStorage::new(MemStorageOptions::default()));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let storage = storage.clone();
                std::thread::spawn(move || storage.put_counter("hits", 1).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(storage.get_counter("hits").unwrap(), Some(100));
    }

    #[test]
    fn concurrent_batches_and_single_puts_interleave_safely() {
        let storage = Arc::new(MemStorage::new(MemStorageOptions::default()));
        let batch: HashMap<String, i64> = [("a".to_string(), 2), ("b".to_string(), 3)].into();
        let handles: Vec<_> = (0..50)
            .map(|i| {
                let storage = storage.clone();
                let batch = batch.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        storage.put_counters(&batch).unwrap();
                    } else {
                        storage.put_counter("a", 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(storage.get_counter("a").unwrap(), Some(25 * 2 + 25));
        assert_eq!(storage.get_counter("b").unwrap(), Some(25 * 3));
    }

    #[test]
    fn counter_overflow_leaves_value_untouched() {
        let storage = MemStorage::new(MemStorageOptions::default());
        storage.put_counter("c", i64::MAX).unwrap();
        let err = storage.put_counter("c", 1).unwrap_err();
        assert!(matches!(err, StorageError::CounterOverflow { .. }));
        assert_eq!(storage.get_counter("c").unwrap(), Some(i64::MAX));
    }

    #[test]
    fn counter_batch_with_overflow_applies_nothing() {
        let storage = MemStorage::new(MemStorageOptions::default());
        storage.put_counter("big", i64::MAX).unwrap();
        let batch: HashMap<String, i64> = [("small".to_string(), 1), ("big".to_string(), 1)].into();
        assert!(storage.put_counters(&batch).is_err());
        assert_eq!(storage.get_counter("small").unwrap(), None);
        assert_eq!(storage.get_counter("big").unwrap(), Some(i64::MAX));
    }

    #[test]
    fn batch_with_empty_name_applies_nothing() {
        let storage = MemStorage::new(MemStorageOptions::default());
        let batch: HashMap<String, f64> = [("ok".to_string(), 1.0), (" ".to_string(), 2.0)].into();
        assert!(matches!(
            storage.put_gauges(&batch),
            Err(StorageError::EmptyName)
        ));
        assert_eq!(storage.get_gauge("ok").unwrap(), None);
    }

    #[test]
    fn inline_mode_saves_on_every_put() {
        let dir = TempDir::new().unwrap();
        let storage = inline_storage(&dir);
        let path = dir.path().join("metrics.json");

        storage.put_gauge("Alloc", 1.5).unwrap();
        let snap = Snapshot::read_from(&path).unwrap();
        assert_eq!(snap.gauges.get("Alloc"), Some(&1.5));

        storage.put_counter("PollCount", 2).unwrap();
        let snap = Snapshot::read_from(&path).unwrap();
        assert_eq!(snap.counters.get("PollCount"), Some(&2));
    }

    #[test]
    fn inline_save_failure_keeps_the_write() {
        let dir = TempDir::new().unwrap();
        // A directory where the snapshot file should be makes the rename fail.
        let path = dir.path().join("metrics.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();
        let storage = MemStorage::new(MemStorageOptions {
            snapshot_path: Some(path),
            save_mode: SaveMode::Inline,
        });

        let err = storage.put_gauge("Alloc", 2.0).unwrap_err();
        assert!(err.is_persistence());
        assert_eq!(storage.get_gauge("Alloc").unwrap(), Some(2.0));
    }

    #[test]
    fn periodic_mode_does_not_touch_disk_on_put() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let storage = MemStorage::new(MemStorageOptions {
            snapshot_path: Some(path.clone()),
            save_mode: SaveMode::Periodic(Duration::from_secs(60)),
        });
        storage.put_gauge("Alloc", 1.0).unwrap();
        assert!(!path.exists());
        storage.save().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn save_without_path_is_reported() {
        let storage = MemStorage::new(MemStorageOptions::default());
        assert!(matches!(storage.save(), Err(StorageError::NoSnapshotPath)));
    }

    #[test]
    fn corrupt_restore_keeps_existing_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, b"{not json").unwrap();

        let storage = MemStorage::new(MemStorageOptions::default());
        storage.put_gauge("kept", 1.0).unwrap();
        let err = storage.restore(&path).unwrap_err();
        assert!(err.is_persistence());
        assert_eq!(storage.get_gauge("kept").unwrap(), Some(1.0));
    }
}
