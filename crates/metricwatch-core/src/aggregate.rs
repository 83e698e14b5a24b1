//! Stateless helpers over a sample sequence: calendar bucketing,
//! min-max normalization, z-score outliers and simple change math.
//!
//! None of these functions fail. Invalid input is reported by
//! [`validate_samples`] as a list of issue strings and left to the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Timelike, Utc};
use serde::Serialize;

use crate::models::{Interval, Quality, Sample};

/// Default z-score cut-off for [`find_outliers`].
pub const DEFAULT_OUTLIER_STD_DEV: f64 = 2.0;

// ---------------------------------------------------------------------------
// Bucketing
// ---------------------------------------------------------------------------

/// Start of the UTC calendar bucket containing `ts`.
/// Weeks start on Sunday.
pub fn bucket_start(ts: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    let midnight = ts.date_naive().and_time(NaiveTime::MIN);
    let start = match interval {
        Interval::Hour => midnight + TimeDelta::hours(i64::from(ts.hour())),
        Interval::Day => midnight,
        Interval::Week => {
            midnight - TimeDelta::days(i64::from(ts.weekday().num_days_from_sunday()))
        }
        Interval::Month => midnight - TimeDelta::days(i64::from(ts.day0())),
    };
    start.and_utc()
}

/// Human-readable key of the bucket starting at `start`.
pub fn bucket_key(start: DateTime<Utc>, interval: Interval) -> String {
    match interval {
        Interval::Hour => start.format("%Y-%m-%dT%H").to_string(),
        Interval::Day | Interval::Week => start.format("%Y-%m-%d").to_string(),
        Interval::Month => start.format("%Y-%m").to_string(),
    }
}

struct BucketAcc {
    metric_id: String,
    sum: f64,
    count: usize,
    all_good: bool,
}

/// Groups samples into calendar buckets and averages each bucket.
///
/// Output is ordered by bucket start. Each output sample carries the mean
/// value, `Good` quality only if every input was good, the bucket start as
/// timestamp and `"<bucketKey>-aggregated"` as id.
pub fn aggregate(samples: &[Sample], interval: Interval) -> Vec<Sample> {
    let mut buckets: BTreeMap<DateTime<Utc>, BucketAcc> = BTreeMap::new();

    for s in samples {
        let start = bucket_start(s.timestamp, interval);
        let acc = buckets.entry(start).or_insert_with(|| BucketAcc {
            metric_id: s.metric_id.clone(),
            sum: 0.0,
            count: 0,
            all_good: true,
        });
        acc.sum += s.value;
        acc.count += 1;
        acc.all_good &= s.quality == Quality::Good;
    }

    buckets
        .into_iter()
        .map(|(start, acc)| Sample {
            id: format!("{}-aggregated", bucket_key(start, interval)),
            metric_id: acc.metric_id,
            value: acc.sum / acc.count as f64,
            timestamp: start,
            quality: if acc.all_good {
                Quality::Good
            } else {
                Quality::Warning
            },
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Population statistics of a value series.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct SeriesStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl SeriesStats {
    /// Returns `None` for an empty series.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        Some(Self {
            count: values.len(),
            min,
            max,
            mean,
            std_dev: variance.sqrt(),
        })
    }

    pub fn from_samples(samples: &[Sample]) -> Option<Self> {
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        Self::from_values(&values)
    }
}

/// Samples whose distance from the mean reaches `threshold_std_dev`
/// population standard deviations. A flat series has no outliers.
pub fn find_outliers(samples: &[Sample], threshold_std_dev: f64) -> Vec<Sample> {
    let Some(stats) = SeriesStats::from_samples(samples) else {
        return Vec::new();
    };
    if stats.std_dev == 0.0 {
        return Vec::new();
    }
    let limit = threshold_std_dev * stats.std_dev;
    samples
        .iter()
        .filter(|s| (s.value - stats.mean).abs() >= limit)
        .cloned()
        .collect()
}

/// Min-max scales values into `[0, 1]`.
/// A zero-range series is returned unchanged.
pub fn normalize(samples: &[Sample]) -> Vec<Sample> {
    let Some(stats) = SeriesStats::from_samples(samples) else {
        return Vec::new();
    };
    let range = stats.max - stats.min;
    if range == 0.0 {
        return samples.to_vec();
    }
    samples
        .iter()
        .map(|s| Sample {
            value: (s.value - stats.min) / range,
            ..s.clone()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Change math
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct Change {
    pub value: f64,
    pub percentage: f64,
}

/// Absolute and relative change. A zero `previous` yields 0%.
pub fn calculate_change(current: f64, previous: f64) -> Change {
    let value = current - previous;
    let percentage = if previous != 0.0 {
        value / previous * 100.0
    } else {
        0.0
    };
    Change { value, percentage }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Describes every sample that breaks the model invariants.
pub fn validate_samples(samples: &[Sample]) -> Vec<String> {
    let mut issues = Vec::new();
    for (i, s) in samples.iter().enumerate() {
        if s.id.trim().is_empty() {
            issues.push(format!("sample {i}: empty id"));
        }
        if s.metric_id.trim().is_empty() {
            issues.push(format!("sample {i} ({}): empty metricId", s.id));
        }
        if !s.value.is_finite() {
            issues.push(format!("sample {i} ({}): non-finite value {}", s.id, s.value));
        }
    }
    issues
}
