mod access_log;
mod background;
mod handlers;
mod openapi;
mod state;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{delete, get, post};
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use metricwatch_core::provider::HttpFetcher;
use metricwatch_core::{
    ActivitySignal, Interval, MetricKey, MultiMetricCoordinator, NotificationRegistry,
    PollingConfig, RegistryConfig,
};

use access_log::AccessLogLayer;
use openapi::ApiDoc;
use state::{SharedState, WebApp};

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(
    name = "metricwatch-web",
    about = "Metric polling service with change notifications",
    version = metricwatch_core::VERSION
)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "METRICWATCH_LISTEN")]
    listen: String,

    /// Base URL of the series data source.
    #[arg(long, default_value = "http://127.0.0.1:9000/api", env = "METRICWATCH_SOURCE_URL")]
    source_url: String,

    /// Metric to poll, as `id=resource/series` or `resource/series`.
    /// Repeat the flag or pass a comma-separated list.
    #[arg(
        long = "metric",
        env = "METRICWATCH_METRICS",
        value_delimiter = ',',
        value_parser = parse_metric
    )]
    metrics: Vec<(String, MetricKey)>,

    /// Request only the last N seconds of each series.
    #[arg(long, env = "METRICWATCH_LOOKBACK")]
    lookback: Option<u64>,

    /// Ask the source to pre-aggregate: hour, day, week or month.
    #[arg(long, env = "METRICWATCH_AGGREGATION")]
    aggregation: Option<Interval>,

    /// Enable automatic polling. With --enabled=false metrics are fetched
    /// only on explicit refresh.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "METRICWATCH_ENABLED")]
    enabled: bool,

    /// Poll interval in seconds while active.
    #[arg(long, default_value = "30", env = "METRICWATCH_INTERVAL",
        value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Poll interval in seconds while inactive (after SIGUSR1 or PUT /api/v1/activity).
    #[arg(long, default_value = "120", env = "METRICWATCH_BACKGROUND_INTERVAL",
        value_parser = clap::value_parser!(u64).range(1..))]
    background_interval: u64,

    /// Minimum change in percent that raises a notification.
    #[arg(long, default_value = "20", env = "METRICWATCH_CHANGE_THRESHOLD")]
    change_threshold: f64,

    /// Failed attempts per cycle before giving up until the next tick.
    #[arg(long, default_value = "3", env = "METRICWATCH_MAX_RETRIES")]
    max_retries: u32,

    /// Base retry delay in milliseconds (doubles per attempt, capped at 30s).
    #[arg(long, default_value = "1000", env = "METRICWATCH_RETRY_DELAY_MS")]
    retry_delay_ms: u64,

    /// Per-request timeout in seconds for the data source.
    #[arg(long, default_value = "30", env = "METRICWATCH_REQUEST_TIMEOUT")]
    request_timeout: u64,

    /// Maximum number of live notifications.
    #[arg(long, default_value = "10", env = "METRICWATCH_NOTIFICATION_CAPACITY")]
    notification_capacity: usize,

    /// Seconds a notification stays live.
    #[arg(long, default_value = "30", env = "METRICWATCH_NOTIFICATION_TTL")]
    notification_ttl: u64,

    /// Seconds between status summary log lines (0 disables).
    #[arg(long, default_value = "60", env = "METRICWATCH_SUMMARY_INTERVAL")]
    summary_interval: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Parses `id=resource/series`; without `id=` the series id names the metric.
fn parse_metric(s: &str) -> Result<(String, MetricKey), String> {
    let (id, key) = match s.split_once('=') {
        Some((id, key)) => (id.trim().to_string(), key.parse::<MetricKey>()?),
        None => {
            let key = s.parse::<MetricKey>()?;
            (key.series_id.clone(), key)
        }
    };
    if id.is_empty() {
        return Err(format!("empty metric id in '{s}'"));
    }
    Ok((id, key))
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["metricwatch_web", "metricwatch_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ============================================================
// Router
// ============================================================

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::handle_health))
        .route("/api/v1/metrics", get(handlers::handle_metrics))
        .route("/api/v1/metrics/refresh", post(handlers::handle_refresh_all))
        .route("/api/v1/metrics/{id}", get(handlers::handle_metric))
        .route("/api/v1/metrics/{id}/refresh", post(handlers::handle_refresh))
        .route(
            "/api/v1/metrics/{id}/force-refresh",
            post(handlers::handle_force_refresh),
        )
        .route("/api/v1/metrics/{id}/aggregate", get(handlers::handle_aggregate))
        .route("/api/v1/metrics/{id}/outliers", get(handlers::handle_outliers))
        .route("/api/v1/metrics/{id}/normalized", get(handlers::handle_normalized))
        .route("/api/v1/metrics/{id}/stats", get(handlers::handle_stats))
        .route(
            "/api/v1/notifications",
            get(handlers::handle_notifications).delete(handlers::handle_clear_notifications),
        )
        .route(
            "/api/v1/notifications/stream",
            get(handlers::handle_notification_stream),
        )
        .route(
            "/api/v1/notifications/{metric_id}",
            delete(handlers::handle_dismiss_notification),
        )
        .route(
            "/api/v1/activity",
            get(handlers::handle_get_activity).put(handlers::handle_put_activity),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    runtime.block_on(async_main(args));
}

async fn async_main(args: Args) {
    info!(
        version = metricwatch_core::VERSION,
        source = %args.source_url,
        metrics = args.metrics.len(),
        "starting"
    );

    let fetcher = match HttpFetcher::new(&args.source_url, Duration::from_secs(args.request_timeout)) {
        Ok(f) => f,
        Err(e) => {
            error!(source = %args.source_url, error = %e, "invalid data source");
            process::exit(1);
        }
    };

    let addr: SocketAddr = match args.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "invalid listen address");
            process::exit(1);
        }
    };

    let config = PollingConfig::default()
        .with_enabled(args.enabled)
        .with_intervals(
            Duration::from_secs(args.interval),
            Duration::from_secs(args.background_interval),
        )
        .with_change_threshold(args.change_threshold)
        .with_retries(args.max_retries, Duration::from_millis(args.retry_delay_ms));

    let registry = Arc::new(NotificationRegistry::new(
        RegistryConfig::default()
            .with_capacity(args.notification_capacity)
            .with_ttl(Duration::from_secs(args.notification_ttl)),
    ));
    let sweeper = registry.spawn_sweeper();

    let activity = ActivitySignal::default();
    let coordinator = Arc::new(MultiMetricCoordinator::new(
        Arc::new(fetcher),
        registry,
        activity.clone(),
        config,
    ));
    let state: SharedState = Arc::new(WebApp::new(coordinator.clone()));

    if args.metrics.is_empty() {
        warn!("no metrics configured (use --metric id=resource/series)");
    }
    for (id, mut key) in args.metrics {
        if let Some(secs) = args.lookback {
            key = key.with_lookback(Duration::from_secs(secs));
        }
        if let Some(aggregation) = args.aggregation {
            key = key.with_aggregation(aggregation);
        }
        if coordinator.contains(&id) {
            warn!(metric_id = %id, "duplicate metric id, last definition wins");
        }
        coordinator.subscribe(id, key);
    }

    tokio::spawn(background::activity_signal_loop(activity));
    if args.summary_interval > 0 {
        tokio::spawn(background::summary_loop(
            state.clone(),
            Duration::from_secs(args.summary_interval),
        ));
    }

    let app = build_router(state.clone())
        .layer(AccessLogLayer)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, "listening");

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(background::shutdown_signal(state.clone()))
    .await
    {
        error!(error = %e, "server error");
    }

    sweeper.abort();
    coordinator.dispose_all();
    info!("stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use metricwatch_core::provider::mock::{MockFetcher, series};
    use metricwatch_core::{ActivityState, ChangeNotification, Severity};
    use serde_json::Value;
    use tower::ServiceExt;

    fn coordinator(config: PollingConfig) -> SharedState {
        let fetcher = MockFetcher::always(series("cpu", &[10.0, 10.0, 10.0, 10.0, 100.0]));
        let coordinator = Arc::new(MultiMetricCoordinator::new(
            Arc::new(fetcher),
            Arc::new(NotificationRegistry::default()),
            ActivitySignal::default(),
            config,
        ));
        coordinator.subscribe("cpu", MetricKey::new("host-1", "cpu"));
        Arc::new(WebApp::new(coordinator))
    }

    async fn polled() -> SharedState {
        let state = coordinator(PollingConfig::default());
        tokio::time::sleep(Duration::from_millis(10)).await;
        state
    }

    async fn send(state: &SharedState, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_owned())
            }
            None => Body::empty(),
        };
        let resp = build_router(state.clone())
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn test_parse_metric() {
        let (id, key) = parse_metric("load=host-1/load1").unwrap();
        assert_eq!(id, "load");
        assert_eq!(key, MetricKey::new("host-1", "load1"));

        let (id, _) = parse_metric("host-1/cpu").unwrap();
        assert_eq!(id, "cpu");

        assert!(parse_metric("=host/cpu").is_err());
        assert!(parse_metric("cpu=nokey").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health() {
        let state = coordinator(PollingConfig::default());
        let resp = build_router(state)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_overview_and_single() {
        let state = polled().await;

        let (status, json) = send(&state, "GET", "/api/v1/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["isAnyLoading"], false);
        assert_eq!(json["isAnyError"], false);
        assert_eq!(json["metrics"][0]["metricId"], "cpu");
        assert_eq!(json["metrics"][0]["phase"]["state"], "waiting");

        let (status, json) = send(&state, "GET", "/api/v1/metrics/cpu", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["key"], "host-1/cpu");
        assert_eq!(json["data"]["samples"].as_array().unwrap().len(), 5);

        let (status, _) = send(&state, "GET", "/api/v1/metrics/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_endpoints() {
        let state = polled().await;

        let (status, json) = send(&state, "GET", "/api/v1/metrics/cpu/outliers", None).await;
        assert_eq!(status, StatusCode::OK);
        let outliers = json.as_array().unwrap();
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0]["value"], 100.0);

        let (status, json) =
            send(&state, "GET", "/api/v1/metrics/cpu/aggregate?interval=hour", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["id"], "2024-01-01T00-aggregated");
        assert_eq!(json[0]["value"], 28.0);

        let (status, _) =
            send(&state, "GET", "/api/v1/metrics/cpu/aggregate?interval=fortnight", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(&state, "GET", "/api/v1/metrics/cpu/normalized", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["value"], 0.0);
        assert_eq!(json[4]["value"], 1.0);

        let (status, json) = send(&state, "GET", "/api/v1/metrics/cpu/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stats"]["count"], 5);
        assert_eq!(json["stats"]["mean"], 28.0);
        assert!(json["issues"].as_array().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_before_first_fetch() {
        let state = coordinator(PollingConfig::default().with_enabled(false));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (status, _) = send(&state, "GET", "/api/v1/metrics/cpu/stats", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = send(&state, "GET", "/api/v1/metrics/other/stats", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_endpoints() {
        let state = polled().await;

        let (status, json) = send(&state, "POST", "/api/v1/metrics/cpu/refresh", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["queued"], 1);

        let (status, _) = send(&state, "POST", "/api/v1/metrics/nope/force-refresh", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let (status, json) = send(&state, "POST", "/api/v1/metrics/refresh", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["queued"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_endpoints() {
        let state = polled().await;
        state.coordinator.registry().add(cpu_jump());

        let (status, json) = send(&state, "GET", "/api/v1/notifications", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["metricId"], "cpu");
        assert_eq!(json[0]["severity"], "high");

        let (status, _) = send(&state, "DELETE", "/api/v1/notifications/cpu", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&state, "DELETE", "/api/v1/notifications/cpu", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&state, "DELETE", "/api/v1/notifications", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.coordinator.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_endpoints() {
        let state = polled().await;

        let (status, json) = send(&state, "GET", "/api/v1/activity", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "active");

        let body = r#"{"state":"inactive"}"#;
        let (status, json) = send(&state, "PUT", "/api/v1/activity", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["changed"], true);
        assert_eq!(state.coordinator.activity().current(), ActivityState::Inactive);

        let (_, json) = send(&state, "PUT", "/api/v1/activity", Some(body)).await;
        assert_eq!(json["changed"], false);

        let (_, json) = send(&state, "GET", "/api/v1/metrics/cpu", None).await;
        assert_eq!(json["isVisible"], false);
    }

    fn cpu_jump() -> ChangeNotification {
        ChangeNotification {
            metric_id: "cpu".into(),
            previous_value: 100.0,
            current_value: 160.0,
            change_percent: 60.0,
            timestamp: series("cpu", &[0.0])[0].timestamp,
            severity: Severity::High,
        }
    }

    async fn next_chunk(body: &mut axum::body::BodyDataStream) -> Option<String> {
        use futures_core::Stream;
        let chunk = std::future::poll_fn(|cx| std::pin::Pin::new(&mut *body).poll_next(cx)).await?;
        Some(String::from_utf8(chunk.unwrap().to_vec()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_stream() {
        let state = polled().await;
        let resp = build_router(state.clone())
            .oneshot(
                Request::get("/api/v1/notifications/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        let mut body = resp.into_body().into_data_stream();

        state.coordinator.registry().add(cpu_jump());
        let frame = next_chunk(&mut body).await.unwrap();
        assert!(frame.starts_with("event: notification\n"), "{frame}");
        let data = frame
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        let json: Value = serde_json::from_str(data).unwrap();
        assert_eq!(json["metricId"], "cpu");
        assert_eq!(json["changePercent"], 60.0);
        assert_eq!(json["severity"], "high");

        background::begin_shutdown(&state);
        let ended = tokio::time::timeout(Duration::from_secs(5), next_chunk(&mut body)).await;
        assert!(matches!(ended, Ok(None)), "stream kept running after shutdown");
        assert!(state.coordinator.is_empty());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_with_open_stream() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let state = coordinator(PollingConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server_state = state.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, build_router(server_state.clone()))
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                    background::begin_shutdown(&server_state);
                })
                .await
        });

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /api/v1/notifications/stream HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = conn.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200 OK"));

        stop_tx.send(()).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(matches!(stopped, Ok(Ok(Ok(())))), "server kept running after shutdown");
    }
}
