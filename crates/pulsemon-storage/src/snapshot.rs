//! On-disk snapshot of the in-memory engine.
//!
//! A snapshot is one JSON object with two optional fields:
//!
//! ```json
//! {"gauge_metrics": {"Alloc": 123.5}, "counter_metrics": {"PollCount": 3}}
//! ```
//!
//! Empty mappings are omitted when writing and absent fields read back as
//! empty. Keys are written in sorted order so identical state always yields
//! identical bytes.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(
        rename = "gauge_metrics",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub gauges: BTreeMap<String, f64>,
    #[serde(
        rename = "counter_metrics",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub counters: BTreeMap<String, i64>,
}

impl Snapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| StorageError::Persistence {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(&bytes)
    }
}

/// Writes `bytes` to `path` through a sibling temporary file that is synced
/// and then renamed over the target, so readers only ever see a complete
/// snapshot.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(StorageError::EmptySnapshot {
            path: path.to_path_buf(),
        });
    }
    let io_err = |source: std::io::Error| StorageError::Persistence {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp = temp_path(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        file.metadata().map(|m| m.len())
    })();

    match result {
        Ok(0) => {
            let _ = fs::remove_file(&tmp);
            Err(StorageError::EmptySnapshot {
                path: path.to_path_buf(),
            })
        }
        Ok(_) => fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err(e)
        }),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(io_err(e))
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
