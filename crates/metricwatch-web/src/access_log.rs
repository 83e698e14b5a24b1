//! Request logging middleware (tower Layer + Service).

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub(crate) struct AccessLogLayer;

impl<S> tower::Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

#[derive(Clone)]
pub(crate) struct AccessLogService<S> {
    inner: S,
}

/// Health checks and API docs are logged at debug so they don't drown real traffic.
fn is_noise(path: &str) -> bool {
    path == "/api/v1/health" || path.starts_with("/swagger-ui") || path.starts_with("/api-docs")
}

/// Metric id addressed by a `/api/v1/metrics/{id}[/...]` path.
fn metric_of(path: &str) -> Option<&str> {
    let id = path.strip_prefix("/api/v1/metrics/")?.split('/').next()?;
    // `/api/v1/metrics/refresh` addresses every metric.
    (!id.is_empty() && id != "refresh").then_some(id)
}

impl<S> tower::Service<Request> for AccessLogService<S>
where
    S: tower::Service<Request, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let client = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "-".to_owned());
        let metric = metric_of(&path).unwrap_or("-").to_owned();
        let t0 = Instant::now();

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let latency_ms = t0.elapsed().as_millis() as u64;
            let status = response.status();
            let code = status.as_u16();
            if status.is_server_error() {
                warn!(client, metric, status = code, latency_ms, "{method} {path}");
            } else if is_noise(&path) {
                debug!(client, status = code, latency_ms, "{method} {path}");
            } else {
                info!(client, metric, status = code, latency_ms, "{method} {path}");
            }
            Ok(response)
        })
    }
}
