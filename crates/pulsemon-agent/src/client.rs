use crate::config::AgentConfig;
use flate2::write::GzEncoder;
use flate2::Compression;
use pulsemon_common::retry::{retry, Backoff};
use pulsemon_common::sign;
use pulsemon_common::types::Metric;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::io::Write;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to compress request body: {0}")]
    Compress(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("gave up after {0:?}")]
    Timeout(Duration),
}

/// Sends metric batches to `POST /updates`.
///
/// Bodies are JSON compressed with gzip. When a key is configured the
/// uncompressed JSON is signed into `HashSHA256`.
pub struct ReportClient {
    http: reqwest::Client,
    updates_url: String,
    hash_key: Option<String>,
    backoff: Backoff,
    deadline: Duration,
}

impl ReportClient {
    pub fn new(config: &AgentConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            updates_url: format!("{}/updates", config.base_url()),
            hash_key: config.hash_key.clone().filter(|k| !k.is_empty()),
            backoff: Backoff::default(),
            deadline: config.request_timeout(),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Posts one batch, retrying failed attempts until the backoff runs out
    /// or the overall deadline passes. Returns the stored values the server
    /// answered with.
    pub async fn send_batch(&self, metrics: &[Metric]) -> Result<Vec<Metric>, ClientError> {
        let json = serde_json::to_vec(metrics)?;
        let signature = self.hash_key.as_deref().map(|key| sign::sign(&json, key));
        let body = gzip(&json)?;

        let body = body.as_slice();
        let signature = signature.as_deref();
        let attempts = retry("report metrics", self.backoff.clone(), move || {
            self.post(body, signature)
        });
        tokio::time::timeout(self.deadline, attempts)
            .await
            .map_err(|_| ClientError::Timeout(self.deadline))?
    }

    async fn post(&self, body: &[u8], signature: Option<&str>) -> Result<Vec<Metric>, ClientError> {
        let mut request = self
            .http
            .post(&self.updates_url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(body.to_vec());
        if let Some(signature) = signature {
            request = request.header(sign::HASH_HEADER, signature);
        }

        let response = request.send().await?;
        let status = response.status();
        let response_signature = response
            .headers()
            .get(sign::HASH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = response.bytes().await?;

        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }
        if let (Some(key), Some(given)) = (&self.hash_key, response_signature) {
            if !sign::verify(&bytes, key, &given) {
                tracing::warn!(url = %self.updates_url, "Response body hash mismatch");
            }
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
