//! OpenAPI documentation definition.

use metricwatch_core::aggregate::SeriesStats;
use metricwatch_core::scheduler::{MetricStatus, Phase};
use metricwatch_core::{ActivityState, ChangeNotification, Quality, Sample, Severity, Snapshot};
use utoipa::OpenApi;

use crate::handlers::{ActivityBody, ActivityChange, MetricsOverview, RefreshResult, StatsResponse};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::handle_health,
        crate::handlers::handle_metrics,
        crate::handlers::handle_metric,
        crate::handlers::handle_refresh,
        crate::handlers::handle_force_refresh,
        crate::handlers::handle_refresh_all,
        crate::handlers::handle_aggregate,
        crate::handlers::handle_outliers,
        crate::handlers::handle_normalized,
        crate::handlers::handle_stats,
        crate::handlers::handle_notifications,
        crate::handlers::handle_clear_notifications,
        crate::handlers::handle_dismiss_notification,
        crate::handlers::handle_get_activity,
        crate::handlers::handle_put_activity,
    ),
    components(schemas(
        MetricsOverview,
        MetricStatus,
        Phase,
        Snapshot,
        Sample,
        Quality,
        SeriesStats,
        StatsResponse,
        RefreshResult,
        ChangeNotification,
        Severity,
        ActivityState,
        ActivityBody,
        ActivityChange,
    )),
    info(
        title = "metricwatch API",
        version = "1.0",
        description = "Metric polling service: subscription state, change notifications and series analysis"
    )
)]
pub(crate) struct ApiDoc;
