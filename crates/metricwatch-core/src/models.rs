//! Data model shared by the fetcher, the scheduler and the HTTP layer.
//!
//! Samples travel over the wire in camelCase JSON
//! (`{id, metricId, value, timestamp, quality}`), so every public type here
//! serializes the same way.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================
// Sample
// ============================================================

/// Data quality tag attached to every sample by the source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Good,
    Warning,
    Error,
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "good" => Ok(Quality::Good),
            "warning" => Ok(Quality::Warning),
            "error" => Ok(Quality::Error),
            other => Err(format!("unknown quality '{other}'")),
        }
    }
}

/// One timestamped metric value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub id: String,
    pub metric_id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
}

impl Sample {
    pub fn new(
        id: impl Into<String>,
        metric_id: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            metric_id: metric_id.into(),
            value,
            timestamp,
            quality: Quality::Good,
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }
}

/// Wire form of a sample before validation.
///
/// Every field is optional so one malformed row cannot fail the whole
/// response; [`parse_samples`] turns rows into [`Sample`]s and reports
/// the rejected ones as issue strings.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSample {
    pub id: Option<String>,
    pub metric_id: Option<String>,
    pub value: Option<f64>,
    pub timestamp: Option<String>,
    pub quality: Option<String>,
}

impl RawSample {
    /// Validates one wire row. `index` is only used in the issue text.
    pub fn into_sample(self, index: usize) -> Result<Sample, String> {
        let metric_id = match self.metric_id {
            Some(m) if !m.trim().is_empty() => m,
            _ => return Err(format!("row {index}: missing metricId")),
        };
        let Some(raw_ts) = self.timestamp else {
            return Err(format!("row {index} ({metric_id}): missing timestamp"));
        };
        let timestamp = DateTime::parse_from_rfc3339(raw_ts.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("row {index} ({metric_id}): invalid timestamp '{raw_ts}': {e}"))?;
        let value = match self.value {
            Some(v) if v.is_finite() => v,
            Some(v) => return Err(format!("row {index} ({metric_id}): non-finite value {v}")),
            None => return Err(format!("row {index} ({metric_id}): missing value")),
        };
        let quality = match self.quality.as_deref() {
            None => Quality::Good,
            Some(q) => q
                .parse()
                .map_err(|e| format!("row {index} ({metric_id}): {e}"))?,
        };
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{metric_id}-{}", timestamp.timestamp_millis()));

        Ok(Sample {
            id,
            metric_id,
            value,
            timestamp,
            quality,
        })
    }
}

/// Converts wire rows, keeping the valid ones in order.
pub fn parse_samples(rows: Vec<RawSample>) -> (Vec<Sample>, Vec<String>) {
    let mut samples = Vec::with_capacity(rows.len());
    let mut issues = Vec::new();
    for (i, row) in rows.into_iter().enumerate() {
        match row.into_sample(i) {
            Ok(s) => samples.push(s),
            Err(issue) => issues.push(issue),
        }
    }
    (samples, issues)
}

// ============================================================
// Snapshot
// ============================================================

/// The complete sample sequence returned by one successful fetch.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub fetched_at: DateTime<Utc>,
    pub samples: Vec<Sample>,
}

impl Snapshot {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            fetched_at: Utc::now(),
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Last value per metric, in order of each metric's first appearance.
    pub fn latest_values(&self) -> Vec<(&str, f64)> {
        let mut order: Vec<&str> = Vec::new();
        let mut latest: HashMap<&str, f64> = HashMap::new();
        for s in &self.samples {
            if latest.insert(s.metric_id.as_str(), s.value).is_none() {
                order.push(s.metric_id.as_str());
            }
        }
        order.into_iter().map(|m| (m, latest[m])).collect()
    }
}

// ============================================================
// Change notifications
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Classifies a (non-negative) change percentage.
    pub fn from_change_percent(pct: f64) -> Self {
        if pct >= 50.0 {
            Severity::High
        } else if pct >= 25.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub metric_id: String,
    pub previous_value: f64,
    pub current_value: f64,
    pub change_percent: f64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

// ============================================================
// Metric keys
// ============================================================

/// Calendar granularity for aggregation (and the `aggregation` query param).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hour,
    Day,
    Week,
    Month,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Hour => "hour",
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(Interval::Hour),
            "day" => Ok(Interval::Day),
            "week" => Ok(Interval::Week),
            "month" => Ok(Interval::Month),
            other => Err(format!(
                "unknown interval '{other}' (expected hour, day, week or month)"
            )),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a fetcher is asked for: one series of one resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub resource_id: String,
    pub series_id: String,
    /// Sliding window ending at fetch time; `None` lets the source decide.
    pub lookback: Option<Duration>,
    pub aggregation: Option<Interval>,
}

impl MetricKey {
    pub fn new(resource_id: impl Into<String>, series_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            series_id: series_id.into(),
            lookback: None,
            aggregation: None,
        }
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = Some(lookback);
        self
    }

    pub fn with_aggregation(mut self, aggregation: Interval) -> Self {
        self.aggregation = Some(aggregation);
        self
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.series_id)
    }
}

impl FromStr for MetricKey {
    type Err = String;

    /// Parses `resource/series`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((r, series)) if !r.is_empty() && !series.is_empty() && !series.contains('/') => {
                Ok(MetricKey::new(r, series))
            }
            _ => Err(format!("invalid metric key '{s}' (expected resource/series)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(metric: Option<&str>, value: Option<f64>, ts: Option<&str>) -> RawSample {
        RawSample {
            id: Some("s1".into()),
            metric_id: metric.map(Into::into),
            value,
            timestamp: ts.map(Into::into),
            quality: None,
        }
    }

    #[test]
    fn test_sample_json_is_camel_case() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap();
        let s = Sample::new("a", "cpu", 1.5, ts).with_quality(Quality::Warning);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["metricId"], "cpu");
        assert_eq!(json["quality"], "warning");
        assert_eq!(json["timestamp"], "2024-03-05T14:00:00Z");
    }

    #[test]
    fn test_parse_samples_reports_bad_rows() {
        let rows = vec![
            raw(Some("cpu"), Some(1.0), Some("2024-03-05T14:00:00Z")),
            raw(None, Some(1.0), Some("2024-03-05T14:00:00Z")),
            raw(Some("cpu"), Some(f64::NAN), Some("2024-03-05T14:00:00Z")),
            raw(Some("cpu"), Some(2.0), Some("yesterday")),
            raw(Some("cpu"), None, Some("2024-03-05T14:00:00Z")),
        ];
        let (samples, issues) = parse_samples(rows);
        assert_eq!(samples.len(), 1);
        assert_eq!(issues.len(), 4);
        assert!(issues[0].contains("missing metricId"));
        assert!(issues[1].contains("non-finite"));
        assert!(issues[2].contains("invalid timestamp"));
        assert!(issues[3].contains("missing value"));
    }

    #[test]
    fn test_raw_sample_without_id_gets_one() {
        let mut r = raw(Some("mem"), Some(3.0), Some("2024-03-05T14:00:00+02:00"));
        r.id = None;
        let s = r.into_sample(0).unwrap();
        assert!(s.id.starts_with("mem-"));
        assert_eq!(s.timestamp, Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_unknown_quality_rejected() {
        let mut r = raw(Some("mem"), Some(3.0), Some("2024-03-05T14:00:00Z"));
        r.quality = Some("excellent".into());
        assert!(r.into_sample(7).unwrap_err().contains("row 7"));
    }

    #[test]
    fn test_latest_values_keeps_first_appearance_order() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let snap = Snapshot::new(vec![
            Sample::new("1", "b", 1.0, ts),
            Sample::new("2", "a", 2.0, ts),
            Sample::new("3", "b", 3.0, ts),
        ]);
        assert_eq!(snap.latest_values(), vec![("b", 3.0), ("a", 2.0)]);
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(Severity::from_change_percent(20.0), Severity::Low);
        assert_eq!(Severity::from_change_percent(25.0), Severity::Medium);
        assert_eq!(Severity::from_change_percent(49.9), Severity::Medium);
        assert_eq!(Severity::from_change_percent(50.0), Severity::High);
    }

    #[test]
    fn test_metric_key_parse() {
        let key: MetricKey = "srv-1/latency".parse().unwrap();
        assert_eq!(key.resource_id, "srv-1");
        assert_eq!(key.series_id, "latency");
        assert_eq!(key.to_string(), "srv-1/latency");
        assert!("no-slash".parse::<MetricKey>().is_err());
        assert!("a/b/c".parse::<MetricKey>().is_err());
    }
}
