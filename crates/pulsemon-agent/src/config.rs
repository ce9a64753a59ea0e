use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Server `host:port`, or a full `http(s)://` URL.
    #[serde(default = "default_server_address")]
    pub server_address: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    /// Metrics per `/updates` request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound for one report request including its retries.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Shared secret for the `HashSHA256` body signature.
    #[serde(default)]
    pub hash_key: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            poll_interval_secs: default_poll_interval_secs(),
            report_interval_secs: default_report_interval_secs(),
            batch_size: default_batch_size(),
            request_timeout_secs: default_request_timeout_secs(),
            hash_key: None,
        }
    }
}

fn default_server_address() -> String {
    "localhost:8080".to_string()
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_report_interval_secs() -> u64 {
    10
}

fn default_batch_size() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl AgentConfig {
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
        config.validate()?;
        Ok(config)
    }

    /// Overrides from `ADDRESS`, `POLL_INTERVAL`, `REPORT_INTERVAL` and `KEY`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("ADDRESS") {
            self.server_address = address;
        }
        if let Some(raw) = lookup("POLL_INTERVAL") {
            self.poll_interval_secs = parse_secs("POLL_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("REPORT_INTERVAL") {
            self.report_interval_secs = parse_secs("REPORT_INTERVAL", &raw)?;
        }
        if let Some(key) = lookup("KEY") {
            self.hash_key = Some(key).filter(|k| !k.trim().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.poll_interval_secs > 0, "poll interval must be positive");
        anyhow::ensure!(self.report_interval_secs > 0, "report interval must be positive");
        anyhow::ensure!(self.batch_size > 0, "batch size must be positive");
        Ok(())
    }

    pub fn base_url(&self) -> String {
        let addr = self.server_address.trim().trim_end_matches('/');
        if addr.contains("://") {
            return addr.to_string();
        }
        format!("http://{addr}")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_secs(var: &str, raw: &str) -> anyhow::Result<u64> {
    raw.trim()
        .parse()
        .with_context(|| format!("{var} must be whole seconds, got '{raw}'"))
}
