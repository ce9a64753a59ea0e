use pulsemon_collector::Collector;
use pulsemon_common::types::{Metric, MetricValue};
use std::collections::BTreeMap;

/// Counter incremented once per poll and sent with every report.
pub const POLL_COUNT: &str = "PollCount";

/// Latest readings between two reports.
#[derive(Debug, Default)]
pub struct Samples {
    gauges: BTreeMap<String, f64>,
    poll_count: i64,
}

impl Samples {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one poll's readings. Gauges replace the previous reading.
    /// Malformed metrics are skipped.
    pub fn record(&mut self, metrics: Vec<Metric>) {
        for metric in metrics {
            let (Ok(name), Ok(value)) = (metric.name(), metric.metric_value()) else {
                tracing::debug!(metric = %metric.id, "Skipping malformed reading");
                continue;
            };
            match value {
                MetricValue::Gauge(v) => {
                    self.gauges.insert(name.to_string(), v);
                }
                MetricValue::Counter(d) => {
                    tracing::debug!(metric = %name, delta = d, "Collectors report gauges only");
                }
            }
        }
        self.poll_count = self.poll_count.saturating_add(1);
    }

    pub fn poll_count(&self) -> i64 {
        self.poll_count
    }

    /// Every gauge in name order, followed by `PollCount`.
    pub fn report(&self) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self
            .gauges
            .iter()
            .map(|(name, v)| Metric::gauge(name.clone(), *v))
            .collect();
        if self.poll_count > 0 {
            metrics.push(Metric::counter(POLL_COUNT, self.poll_count));
        }
        metrics
    }

    /// Removes `reported` polls from the counter once the server has them.
    /// Polls recorded while the report was in flight are kept.
    pub fn flush_poll_count(&mut self, reported: i64) {
        self.poll_count = (self.poll_count - reported).max(0);
    }
}

/// Runs every collector once per call.
pub struct Poller {
    collectors: Vec<Box<dyn Collector>>,
}

impl Poller {
    pub fn new(collectors: Vec<Box<dyn Collector>>) -> Self {
        Self { collectors }
    }

    /// Readings from every collector that succeeded. A failing collector
    /// is logged and skipped.
    pub fn poll(&mut self) -> Vec<Metric> {
        let mut all = Vec::new();
        for collector in &mut self.collectors {
            match collector.collect() {
                Ok(metrics) => all.extend(metrics),
                Err(e) => {
                    tracing::warn!(collector = collector.name(), error = %e, "Collection failed")
                }
            }
        }
        tracing::debug!(count = all.len(), "Collected metrics");
        all
    }
}
