use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port` the HTTP listener binds to.
    #[serde(default = "default_address")]
    pub address: String,
    /// Shared secret for the `HashSHA256` body signature. Signing is off when
    /// unset or empty.
    #[serde(default)]
    pub hash_key: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Seconds between snapshots of the in-memory backend; 0 saves on every
    /// write.
    #[serde(default = "default_store_interval_secs")]
    pub store_interval_secs: u64,
    /// Snapshot file. No file is read or written when unset.
    #[serde(default = "default_file_storage_path")]
    pub file_storage_path: Option<PathBuf>,
    /// Load the snapshot file at startup.
    #[serde(default = "default_restore")]
    pub restore: bool,
    /// Relational backend; the in-memory backend is used when unset.
    #[serde(default)]
    pub database_dsn: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            hash_key: None,
            storage: StorageConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_interval_secs: default_store_interval_secs(),
            file_storage_path: default_file_storage_path(),
            restore: default_restore(),
            database_dsn: None,
        }
    }
}

fn default_address() -> String {
    "localhost:8080".to_string()
}

fn default_store_interval_secs() -> u64 {
    300
}

fn default_file_storage_path() -> Option<PathBuf> {
    Some(PathBuf::from("/tmp/metrics-db.json"))
}

fn default_restore() -> bool {
    true
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Configuration from an optional TOML file, then environment overrides.
    pub fn resolve(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                Self::load(path).with_context(|| format!("failed to load config '{path}'"))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overrides fields from `ADDRESS`, `STORE_INTERVAL`, `FILE_STORAGE_PATH`,
    /// `RESTORE`, `DATABASE_DSN` and `KEY` as returned by `lookup`.
    ///
    /// An empty `FILE_STORAGE_PATH`, `DATABASE_DSN` or `KEY` clears the
    /// setting.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("ADDRESS") {
            self.address = address;
        }
        if let Some(raw) = lookup("STORE_INTERVAL") {
            self.storage.store_interval_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("STORE_INTERVAL must be whole seconds, got '{raw}'"))?;
        }
        if let Some(path) = lookup("FILE_STORAGE_PATH") {
            self.storage.file_storage_path = non_empty(path).map(PathBuf::from);
        }
        if let Some(raw) = lookup("RESTORE") {
            self.storage.restore = raw
                .trim()
                .parse()
                .with_context(|| format!("RESTORE must be true or false, got '{raw}'"))?;
        }
        if let Some(dsn) = lookup("DATABASE_DSN") {
            self.storage.database_dsn = non_empty(dsn);
        }
        if let Some(key) = lookup("KEY") {
            self.hash_key = non_empty(key);
        }
        Ok(())
    }

    /// The signing key, if signing is enabled.
    pub fn signing_key(&self) -> Option<&str> {
        self.hash_key.as_deref().filter(|k| !k.is_empty())
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.address, "localhost:8080");
        assert_eq!(config.storage.store_interval_secs, 300);
        assert_eq!(
            config.storage.file_storage_path,
            Some(PathBuf::from("/tmp/metrics-db.json"))
        );
        assert!(config.storage.restore);
        assert!(config.storage.database_dsn.is_none());
        assert!(config.signing_key().is_none());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            address = "0.0.0.0:9000"

            [storage]
            store_interval_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.address, "0.0.0.0:9000");
        assert_eq!(config.storage.store_interval_secs, 0);
        assert!(config.storage.restore);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = ServerConfig::default();
        config
            .apply_env(env(&[
                ("ADDRESS", "127.0.0.1:1234"),
                ("STORE_INTERVAL", "10"),
                ("RESTORE", "false"),
                ("DATABASE_DSN", "sqlite:///var/lib/pulsemon.db"),
                ("KEY", "secret"),
            ]))
            .unwrap();
        assert_eq!(config.address, "127.0.0.1:1234");
        assert_eq!(config.storage.store_interval_secs, 10);
        assert!(!config.storage.restore);
        assert_eq!(
            config.storage.database_dsn.as_deref(),
            Some("sqlite:///var/lib/pulsemon.db")
        );
        assert_eq!(config.signing_key(), Some("secret"));
    }

    #[test]
    fn empty_values_clear_optional_settings() {
        let mut config = ServerConfig::default();
        config.hash_key = Some("old".into());
        config
            .apply_env(env(&[("FILE_STORAGE_PATH", ""), ("KEY", "")]))
            .unwrap();
        assert!(config.storage.file_storage_path.is_none());
        assert!(config.signing_key().is_none());
    }

    #[test]
    fn malformed_interval_is_rejected() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env(env(&[("STORE_INTERVAL", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("STORE_INTERVAL"));
    }
}
