use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The two metric kinds and their merge rule.
///
/// # Examples
///
/// ```
/// use pulsemon_common::types::MetricKind;
///
/// let kind: MetricKind = " Gauge ".parse().unwrap();
/// assert_eq!(kind, MetricKind::Gauge);
/// assert_eq!(MetricKind::Counter.to_string(), "counter");
/// assert!("histogram".parse::<MetricKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Point-in-time `f64`; a write replaces the stored value.
    Gauge,
    /// Running `i64`; a write adds its delta to the stored value.
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            _ => Err(ValidationError::UnknownKind(s.to_string())),
        }
    }
}

/// Malformed metric input, rejected before it reaches storage.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown metric type {0}")]
    UnknownKind(String),

    #[error("empty metric name")]
    EmptyName,

    #[error("wrong {kind} value {raw}")]
    InvalidValue { kind: MetricKind, raw: String },

    #[error("not specified gauge value")]
    MissingGaugeValue,

    #[error("not specified counter delta")]
    MissingCounterDelta,

    #[error("counter {0} overflows when summing batch deltas")]
    CounterOverflow(String),
}

/// Returns the trimmed metric name, or [`ValidationError::EmptyName`].
pub fn validate_name(name: &str) -> Result<&str, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    Ok(name)
}

/// A typed metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    /// Parses the textual value of a metric of the given kind.
    ///
    /// Gauges must be finite: `NaN` and infinities have no JSON form and
    /// would not survive a snapshot.
    ///
    /// ```
    /// use pulsemon_common::types::{MetricKind, MetricValue};
    ///
    /// assert_eq!(
    ///     MetricValue::parse(MetricKind::Counter, "42").unwrap(),
    ///     MetricValue::Counter(42)
    /// );
    /// assert!(MetricValue::parse(MetricKind::Counter, "1.1").is_err());
    /// assert!(MetricValue::parse(MetricKind::Gauge, "NaN").is_err());
    /// ```
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidValue {
            kind,
            raw: raw.to_string(),
        };
        let trimmed = raw.trim();
        match kind {
            MetricKind::Gauge => {
                let v: f64 = trimmed.parse().map_err(|_| invalid())?;
                if !v.is_finite() {
                    return Err(invalid());
                }
                Ok(MetricValue::Gauge(v))
            }
            MetricKind::Counter => trimmed
                .parse::<i64>()
                .map(MetricValue::Counter)
                .map_err(|_| invalid()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Gauge(v) => f.write_str(&format_gauge(*v)),
            MetricValue::Counter(v) => write!(f, "{v}"),
        }
    }
}

/// Shortest decimal text that round-trips to the same `f64`, never in
/// exponent notation.
pub fn format_gauge(value: f64) -> String {
    value.to_string()
}

/// A metric as it travels over HTTP.
///
/// `type` is kept as raw text so a bad kind is reported as a validation
/// error instead of a JSON decoding failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge.to_string(),
            delta: None,
            value: Some(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter.to_string(),
            delta: Some(delta),
            value: None,
        }
    }

    pub fn kind(&self) -> Result<MetricKind, ValidationError> {
        self.kind.parse()
    }

    pub fn name(&self) -> Result<&str, ValidationError> {
        validate_name(&self.id)
    }

    /// The payload matching the declared kind.
    pub fn metric_value(&self) -> Result<MetricValue, ValidationError> {
        match self.kind()? {
            MetricKind::Gauge => match self.value {
                Some(v) if v.is_finite() => Ok(MetricValue::Gauge(v)),
                Some(v) => Err(ValidationError::InvalidValue {
                    kind: MetricKind::Gauge,
                    raw: v.to_string(),
                }),
                None => Err(ValidationError::MissingGaugeValue),
            },
            MetricKind::Counter => self
                .delta
                .map(MetricValue::Counter)
                .ok_or(ValidationError::MissingCounterDelta),
        }
    }
}

/// Updates keyed by unique metric name, ready for the storage batch calls.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetricBatch {
    pub gauges: HashMap<String, f64>,
    pub counters: HashMap<String, i64>,
}

impl MetricBatch {
    /// Folds an ordered list of updates into per-kind mappings.
    ///
    /// A name repeated within the list keeps its last gauge value, while
    /// counter deltas for a repeated name are summed, so no update is lost.
    /// The whole list is rejected if any entry is malformed.
    ///
    /// ```
    /// use pulsemon_common::types::{Metric, MetricBatch};
    ///
    /// let batch = MetricBatch::from_metrics(&[
    ///     Metric::gauge("Alloc", 1.0),
    ///     Metric::counter("PollCount", 2),
    ///     Metric::gauge("Alloc", 3.5),
    ///     Metric::counter("PollCount", 5),
    /// ])
    /// .unwrap();
    /// assert_eq!(batch.gauges["Alloc"], 3.5);
    /// assert_eq!(batch.counters["PollCount"], 7);
    /// ```
    pub fn from_metrics(metrics: &[Metric]) -> Result<Self, ValidationError> {
        let mut batch = Self::default();
        for metric in metrics {
            let name = metric.name()?;
            match metric.metric_value()? {
                MetricValue::Gauge(v) => {
                    batch.gauges.insert(name.to_string(), v);
                }
                MetricValue::Counter(delta) => {
                    let slot = batch.counters.entry(name.to_string()).or_insert(0);
                    *slot = slot
                        .checked_add(delta)
                        .ok_or_else(|| ValidationError::CounterOverflow(name.to_string()))?;
                }
            }
        }
        Ok(batch)
    }

    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty() && self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.gauges.len() + self.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_json_omits_absent_payload() {
        let json = serde_json::to_string(&Metric::gauge("Alloc", 123.5)).unwrap();
        assert_eq!(json, r#"{"id":"Alloc","type":"gauge","value":123.5}"#);

        let json = serde_json::to_string(&Metric::counter("PollCount", 3)).unwrap();
        assert_eq!(json, r#"{"id":"PollCount","type":"counter","delta":3}"#);
    }

    #[test]
    fn metric_json_accepts_unknown_kind_text() {
        let m: Metric = serde_json::from_str(r#"{"id":"x","type":"histogram"}"#).unwrap();
        assert_eq!(
            m.kind(),
            Err(ValidationError::UnknownKind("histogram".to_string()))
        );
    }

    #[test]
    fn metric_value_requires_matching_payload() {
        let m = Metric {
            id: "Alloc".into(),
            kind: "gauge".into(),
            delta: Some(1),
            value: None,
        };
        assert_eq!(m.metric_value(), Err(ValidationError::MissingGaugeValue));

        let m = Metric {
            id: "PollCount".into(),
            kind: "counter".into(),
            delta: None,
            value: Some(1.0),
        };
        assert_eq!(m.metric_value(), Err(ValidationError::MissingCounterDelta));
    }

    #[test]
    fn parse_rejects_malformed_values() {
        assert!(MetricValue::parse(MetricKind::Gauge, "gauge").is_err());
        assert!(MetricValue::parse(MetricKind::Gauge, "inf").is_err());
        assert!(MetricValue::parse(MetricKind::Counter, "counter").is_err());
        assert!(MetricValue::parse(MetricKind::Counter, "1.1").is_err());
        assert_eq!(
            MetricValue::parse(MetricKind::Gauge, "1.1").unwrap(),
            MetricValue::Gauge(1.1)
        );
        assert_eq!(
            MetricValue::parse(MetricKind::Counter, "-7").unwrap(),
            MetricValue::Counter(-7)
        );
    }

    #[test]
    fn gauge_text_is_shortest_round_trip() {
        assert_eq!(format_gauge(123.5), "123.5");
        assert_eq!(format_gauge(0.1), "0.1");
        assert_eq!(format_gauge(2.0), "2");
        assert_eq!(format_gauge(1e21), "1000000000000000000000");
        let text = format_gauge(0.1 + 0.2);
        assert_eq!(text.parse::<f64>().unwrap(), 0.1 + 0.2);
    }

    #[test]
    fn empty_names_are_rejected() {
        assert_eq!(validate_name("   "), Err(ValidationError::EmptyName));
        assert_eq!(validate_name(" Alloc "), Ok("Alloc"));
        let err = MetricBatch::from_metrics(&[Metric::gauge("", 1.0)]).unwrap_err();
        assert_eq!(err, ValidationError::EmptyName);
    }

    #[test]
    fn batch_sums_counters_and_keeps_last_gauge() {
        let batch = MetricBatch::from_metrics(&[
            Metric::counter("PollCount", 1),
            Metric::gauge(" Alloc", 1.0),
            Metric::counter("PollCount ", 1),
            Metric::gauge("Alloc", 2.0),
            Metric::counter("PollCount", 1),
        ])
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.gauges.get("Alloc"), Some(&2.0));
        assert_eq!(batch.counters.get("PollCount"), Some(&3));
    }

    #[test]
    fn batch_rejects_counter_overflow() {
        let err = MetricBatch::from_metrics(&[
            Metric::counter("c", i64::MAX),
            Metric::counter("c", 1),
        ])
        .unwrap_err();
        assert_eq!(err, ValidationError::CounterOverflow("c".to_string()));
    }

    #[test]
    fn gauge_and_counter_may_share_a_name() {
        let batch =
            MetricBatch::from_metrics(&[Metric::gauge("x", 1.5), Metric::counter("x", 4)]).unwrap();
        assert_eq!(batch.gauges["x"], 1.5);
        assert_eq!(batch.counters["x"], 4);
    }
}
