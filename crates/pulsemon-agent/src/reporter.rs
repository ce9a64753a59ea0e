use crate::client::ReportClient;
use crate::poller::Samples;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of one report cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportSummary {
    pub sent: usize,
    pub failed: usize,
}

/// Pushes the current samples to the server in fixed-size chunks.
pub struct Reporter {
    client: ReportClient,
    samples: Arc<Mutex<Samples>>,
    batch_size: usize,
}

impl Reporter {
    pub fn new(client: ReportClient, samples: Arc<Mutex<Samples>>, batch_size: usize) -> Self {
        Self {
            client,
            samples,
            batch_size: batch_size.max(1),
        }
    }

    /// Sends every sample, `batch_size` metrics per request with the
    /// remainder in the last one. Stops at the first chunk that fails.
    ///
    /// `PollCount` is always the last metric, so the polls it carries are
    /// flushed only when every chunk got through.
    pub async fn report_once(&self) -> ReportSummary {
        let (metrics, polls) = {
            let samples = self.samples.lock().await;
            (samples.report(), samples.poll_count())
        };
        let mut summary = ReportSummary::default();
        if metrics.is_empty() {
            return summary;
        }

        for chunk in metrics.chunks(self.batch_size) {
            match self.client.send_batch(chunk).await {
                Ok(_) => summary.sent += chunk.len(),
                Err(e) => {
                    summary.failed = metrics.len() - summary.sent;
                    tracing::warn!(
                        error = %e,
                        sent = summary.sent,
                        pending = summary.failed,
                        "Report failed"
                    );
                    return summary;
                }
            }
        }

        self.samples.lock().await.flush_poll_count(polls);
        tracing::info!(metrics = summary.sent, polls, "Metrics reported");
        summary
    }
}
