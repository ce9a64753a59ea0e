use anyhow::Context;
use pulsemon_common::retry::{retry, Backoff};
use pulsemon_storage::MemStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Writes the in-memory backend's snapshot on a fixed interval until
/// cancelled.
pub struct SnapshotSaver {
    storage: Arc<MemStorage>,
    interval: Duration,
    backoff: Backoff,
}

impl SnapshotSaver {
    pub fn new(storage: Arc<MemStorage>, interval: Duration) -> Self {
        Self {
            storage,
            interval,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    /// Ticks until `token` is cancelled. The first save happens one full
    /// interval after start. Cancellation also cuts short a save that is
    /// waiting between retries; every write is atomic, so the file on disk
    /// is never left half written.
    pub async fn run(self, token: CancellationToken) {
        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        tracing::info!(interval_secs = self.interval.as_secs(), "Snapshot saver started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            tracing::warn!("Snapshot save abandoned on shutdown");
                            break;
                        }
                        result = save_with_retry(&self.storage, self.backoff.clone()) => match result {
                            Ok(()) => tracing::debug!("Snapshot saved"),
                            Err(e) => tracing::error!(error = %e, "Snapshot save failed"),
                        },
                    }
                }
            }
        }
        tracing::info!("Snapshot saver stopped");
    }
}

/// Saves once on the blocking pool.
pub async fn save_now(storage: &Arc<MemStorage>) -> anyhow::Result<()> {
    let storage = Arc::clone(storage);
    tokio::task::spawn_blocking(move || storage.save())
        .await
        .context("snapshot task panicked")??;
    Ok(())
}

async fn save_with_retry(storage: &Arc<MemStorage>, backoff: Backoff) -> anyhow::Result<()> {
    retry("snapshot save", backoff, || save_now(storage)).await
}
