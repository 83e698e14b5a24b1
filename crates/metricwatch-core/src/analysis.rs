//! Change detection between two consecutive snapshots of the same series.

use std::collections::HashMap;

use chrono::Utc;

use crate::models::{ChangeNotification, Severity, Snapshot};

/// Relative change in percent, rounded to two decimals.
///
/// Returns `None` when `previous` is zero: a relative change from zero is
/// undefined and must not produce a notification.
pub fn change_percent(previous: f64, current: f64) -> Option<f64> {
    if previous == 0.0 {
        return None;
    }
    let pct = (current - previous).abs() / previous.abs() * 100.0;
    Some((pct * 100.0).round() / 100.0)
}

/// Compares one metric's value across two snapshots.
pub fn detect_change(
    metric_id: &str,
    previous: f64,
    current: f64,
    threshold: f64,
) -> Option<ChangeNotification> {
    let pct = change_percent(previous, current)?;
    if pct < threshold {
        return None;
    }
    Some(ChangeNotification {
        metric_id: metric_id.to_string(),
        previous_value: previous,
        current_value: current,
        change_percent: pct,
        timestamp: Utc::now(),
        severity: Severity::from_change_percent(pct),
    })
}

/// Compares every metric present in both snapshots.
///
/// A metric's value is its last sample in snapshot order. Metrics with no
/// baseline in `previous` are skipped. Output follows the order metrics
/// first appear in `current`.
pub fn detect_changes(
    previous: &Snapshot,
    current: &Snapshot,
    threshold: f64,
) -> Vec<ChangeNotification> {
    let baseline: HashMap<&str, f64> = previous.latest_values().into_iter().collect();

    current
        .latest_values()
        .into_iter()
        .filter_map(|(metric_id, value)| {
            let prev = *baseline.get(metric_id)?;
            detect_change(metric_id, prev, value, threshold)
        })
        .collect()
}
