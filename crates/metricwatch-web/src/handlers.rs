//! HTTP request handlers: metric status, refresh, analysis, notifications and activity.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{error, info, warn};

use metricwatch_core::aggregate::{self, DEFAULT_OUTLIER_STD_DEV, SeriesStats};
use metricwatch_core::{
    ActivityState, ChangeNotification, Interval, MetricStatus, Sample, Snapshot,
};

use crate::state::{AppState, SSE_CONNECTIONS, SharedState};

/// Looks up the current snapshot of `id`: 404 if not subscribed, 503 if
/// nothing has been fetched yet.
fn current_snapshot(state: &SharedState, id: &str) -> Result<Arc<Snapshot>, StatusCode> {
    if !state.coordinator.contains(id) {
        return Err(StatusCode::NOT_FOUND);
    }
    state.coordinator.data(id).ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

// ============================================================
// Health
// ============================================================

#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = String)
    )
)]
pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Metrics
// ============================================================

#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MetricsOverview {
    metrics: Vec<MetricStatus>,
    is_any_loading: bool,
    is_any_error: bool,
    is_any_refreshing: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/metrics",
    responses(
        (status = 200, description = "All subscriptions with aggregate flags", body = MetricsOverview)
    )
)]
pub(crate) async fn handle_metrics(State(state): AppState) -> Json<MetricsOverview> {
    let metrics = state.coordinator.statuses();
    Json(MetricsOverview {
        is_any_loading: metrics.iter().any(|m| m.is_loading),
        is_any_error: metrics.iter().any(|m| m.error.is_some()),
        is_any_refreshing: metrics.iter().any(|m| m.is_refreshing),
        metrics,
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/metrics/{id}",
    params(("id" = String, Path, description = "Metric id")),
    responses(
        (status = 200, description = "Subscription state", body = MetricStatus),
        (status = 404, description = "Unknown metric")
    )
)]
pub(crate) async fn handle_metric(
    State(state): AppState,
    Path(id): Path<String>,
) -> Result<Json<MetricStatus>, StatusCode> {
    state.coordinator.get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// ============================================================
// Refresh
// ============================================================

#[derive(Serialize, utoipa::ToSchema)]
pub(crate) struct RefreshResult {
    /// Number of fetches queued (0 when coalesced with one in flight).
    queued: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/metrics/{id}/refresh",
    params(("id" = String, Path, description = "Metric id")),
    responses(
        (status = 202, description = "Refresh requested", body = RefreshResult),
        (status = 404, description = "Unknown metric")
    )
)]
pub(crate) async fn handle_refresh(
    State(state): AppState,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RefreshResult>), StatusCode> {
    let queued = state.coordinator.refresh(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RefreshResult {
            queued: usize::from(queued),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/metrics/{id}/force-refresh",
    params(("id" = String, Path, description = "Metric id")),
    responses(
        (status = 202, description = "Forced fetch requested", body = RefreshResult),
        (status = 404, description = "Unknown metric")
    )
)]
pub(crate) async fn handle_force_refresh(
    State(state): AppState,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RefreshResult>), StatusCode> {
    let queued = state.coordinator.force_refresh(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RefreshResult {
            queued: usize::from(queued),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/metrics/refresh",
    responses(
        (status = 202, description = "Refresh requested for every metric", body = RefreshResult)
    )
)]
pub(crate) async fn handle_refresh_all(
    State(state): AppState,
) -> (StatusCode, Json<RefreshResult>) {
    let queued = state.coordinator.refresh_all();
    (StatusCode::ACCEPTED, Json(RefreshResult { queued }))
}

// ============================================================
// Analysis
// ============================================================

#[derive(Deserialize, utoipa::IntoParams)]
pub(crate) struct AggregateQuery {
    /// Bucket size: hour, day (default), week or month.
    interval: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/metrics/{id}/aggregate",
    params(("id" = String, Path, description = "Metric id"), AggregateQuery),
    responses(
        (status = 200, description = "One averaged sample per bucket", body = Vec<Sample>),
        (status = 400, description = "Invalid interval"),
        (status = 404, description = "Unknown metric"),
        (status = 503, description = "No data fetched yet")
    )
)]
pub(crate) async fn handle_aggregate(
    State(state): AppState,
    Path(id): Path<String>,
    Query(query): Query<AggregateQuery>,
) -> Result<Json<Vec<Sample>>, StatusCode> {
    let interval = match query.interval.as_deref() {
        None => Interval::Day,
        Some(s) => s.parse().map_err(|_| StatusCode::BAD_REQUEST)?,
    };
    let snapshot = current_snapshot(&state, &id)?;
    Ok(Json(aggregate::aggregate(&snapshot.samples, interval)))
}

#[derive(Deserialize, utoipa::IntoParams)]
pub(crate) struct OutlierQuery {
    /// Distance from the mean in standard deviations (default 2).
    threshold: Option<f64>,
}

#[utoipa::path(
    get,
    path = "/api/v1/metrics/{id}/outliers",
    params(("id" = String, Path, description = "Metric id"), OutlierQuery),
    responses(
        (status = 200, description = "Samples far from the mean", body = Vec<Sample>),
        (status = 400, description = "Invalid threshold"),
        (status = 404, description = "Unknown metric"),
        (status = 503, description = "No data fetched yet")
    )
)]
pub(crate) async fn handle_outliers(
    State(state): AppState,
    Path(id): Path<String>,
    Query(query): Query<OutlierQuery>,
) -> Result<Json<Vec<Sample>>, StatusCode> {
    let threshold = query.threshold.unwrap_or(DEFAULT_OUTLIER_STD_DEV);
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(StatusCode::BAD_REQUEST);
    }
    let snapshot = current_snapshot(&state, &id)?;
    Ok(Json(aggregate::find_outliers(&snapshot.samples, threshold)))
}

#[utoipa::path(
    get,
    path = "/api/v1/metrics/{id}/normalized",
    params(("id" = String, Path, description = "Metric id")),
    responses(
        (status = 200, description = "Values min-max scaled into [0, 1]", body = Vec<Sample>),
        (status = 404, description = "Unknown metric"),
        (status = 503, description = "No data fetched yet")
    )
)]
pub(crate) async fn handle_normalized(
    State(state): AppState,
    Path(id): Path<String>,
) -> Result<Json<Vec<Sample>>, StatusCode> {
    let snapshot = current_snapshot(&state, &id)?;
    Ok(Json(aggregate::normalize(&snapshot.samples)))
}

#[derive(Serialize, utoipa::ToSchema)]
pub(crate) struct StatsResponse {
    /// Absent for an empty snapshot.
    stats: Option<SeriesStats>,
    issues: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/metrics/{id}/stats",
    params(("id" = String, Path, description = "Metric id")),
    responses(
        (status = 200, description = "Series statistics and validation issues", body = StatsResponse),
        (status = 404, description = "Unknown metric"),
        (status = 503, description = "No data fetched yet")
    )
)]
pub(crate) async fn handle_stats(
    State(state): AppState,
    Path(id): Path<String>,
) -> Result<Json<StatsResponse>, StatusCode> {
    let snapshot = current_snapshot(&state, &id)?;
    Ok(Json(StatsResponse {
        stats: SeriesStats::from_samples(&snapshot.samples),
        issues: aggregate::validate_samples(&snapshot.samples),
    }))
}

// ============================================================
// Notifications
// ============================================================

#[utoipa::path(
    get,
    path = "/api/v1/notifications",
    responses(
        (status = 200, description = "Live notifications, newest first", body = Vec<ChangeNotification>)
    )
)]
pub(crate) async fn handle_notifications(State(state): AppState) -> Json<Vec<ChangeNotification>> {
    Json(state.coordinator.registry().notifications())
}

#[utoipa::path(
    delete,
    path = "/api/v1/notifications",
    responses(
        (status = 204, description = "All notifications cleared")
    )
)]
pub(crate) async fn handle_clear_notifications(State(state): AppState) -> StatusCode {
    state.coordinator.registry().clear();
    StatusCode::NO_CONTENT
}

#[utoipa::path(
    delete,
    path = "/api/v1/notifications/{metric_id}",
    params(("metric_id" = String, Path, description = "Metric id of the notification")),
    responses(
        (status = 204, description = "Notification dismissed"),
        (status = 404, description = "No notification for this metric")
    )
)]
pub(crate) async fn handle_dismiss_notification(
    State(state): AppState,
    Path(metric_id): Path<String>,
) -> StatusCode {
    if state.coordinator.registry().dismiss(&metric_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// ============================================================
// SSE streaming
// ============================================================

struct SseGuard;

impl Drop for SseGuard {
    fn drop(&mut self) {
        let active = SSE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed) - 1;
        info!(active_connections = active, "SSE client disconnected");
    }
}

/// Resolves once shutdown has begun, or when the state that owns the
/// sender is gone.
async fn stopping(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

pub(crate) async fn handle_notification_stream(
    State(state): AppState,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>> {
    let active = SSE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    info!(active_connections = active, "SSE client connected");

    let mut rx = state.coordinator.registry().subscribe();
    let mut shutdown = state.shutdown_rx();

    let stream = async_stream::stream! {
        let _guard = SseGuard;
        loop {
            let received = tokio::select! {
                biased;
                () = stopping(&mut shutdown) => break,
                received = rx.recv() => received,
            };
            let notification = match received {
                Ok(notification) => notification,
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match serde_json::to_string(&notification) {
                Ok(json) => yield Ok(Event::default().event("notification").data(json)),
                Err(e) => error!(metric_id = %notification.metric_id, error = %e, "failed to serialize notification"),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================
// Activity
// ============================================================

#[derive(Serialize, Deserialize, utoipa::ToSchema)]
pub(crate) struct ActivityBody {
    state: ActivityState,
}

#[derive(Serialize, utoipa::ToSchema)]
pub(crate) struct ActivityChange {
    state: ActivityState,
    /// False when the signal already had this state.
    changed: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/activity",
    responses(
        (status = 200, description = "Current activity state", body = ActivityBody)
    )
)]
pub(crate) async fn handle_get_activity(State(state): AppState) -> Json<ActivityBody> {
    Json(ActivityBody {
        state: state.coordinator.activity().current(),
    })
}

#[utoipa::path(
    put,
    path = "/api/v1/activity",
    request_body = ActivityBody,
    responses(
        (status = 200, description = "Activity state applied", body = ActivityChange)
    )
)]
pub(crate) async fn handle_put_activity(
    State(state): AppState,
    Json(body): Json<ActivityBody>,
) -> Json<ActivityChange> {
    let changed = state.coordinator.activity().set(body.state);
    if changed {
        info!(state = ?body.state, "activity changed via API");
    }
    Json(ActivityChange {
        state: body.state,
        changed,
    })
}
