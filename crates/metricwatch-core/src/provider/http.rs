//! HTTP fetcher for the series data endpoint.
//!
//! `GET {base}/resource/{resourceId}/series/{seriesId}/data?startDate&endDate&aggregation`
//! returning a JSON array of `{id, metricId, value, timestamp, quality}`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use reqwest::{Client, Url};
use tracing::{debug, warn};

use crate::models::{MetricKey, RawSample, Sample, parse_samples};

use super::{FetchError, SampleFetcher};

/// Fetches series data from an HTTP source.
pub struct HttpFetcher {
    client: Client,
    base_url: Url,
}

impl HttpFetcher {
    /// Creates a fetcher for `base_url` with a per-request `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|e| FetchError::Other(format!("invalid base URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(FetchError::Other(format!(
                "base URL '{}' cannot carry a path",
                base_url
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Other(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    /// Endpoint for `key`; path segments are percent-encoded.
    fn series_url(&self, key: &MetricKey) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                FetchError::Other(format!(
                    "base URL '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend([
                "resource",
                key.resource_id.as_str(),
                "series",
                key.series_id.as_str(),
                "data",
            ]);
        Ok(url)
    }
}

/// Query parameters for `key` as of `now`.
fn query_params(key: &MetricKey, now: DateTime<Utc>) -> Result<Vec<(&'static str, String)>, FetchError> {
    let mut params = Vec::with_capacity(3);
    if let Some(lookback) = key.lookback {
        let window = TimeDelta::from_std(lookback)
            .map_err(|e| FetchError::Other(format!("lookback out of range: {}", e)))?;
        let start = now - window;
        params.push(("startDate", start.to_rfc3339_opts(SecondsFormat::Millis, true)));
        params.push(("endDate", now.to_rfc3339_opts(SecondsFormat::Millis, true)));
    }
    if let Some(aggregation) = key.aggregation {
        params.push(("aggregation", aggregation.as_str().to_string()));
    }
    Ok(params)
}

fn map_request_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_decode() {
        FetchError::Decode(e.to_string())
    } else {
        FetchError::Transport(e.to_string())
    }
}

#[async_trait]
impl SampleFetcher for HttpFetcher {
    async fn fetch(&self, key: &MetricKey) -> Result<Vec<Sample>, FetchError> {
        let url = self.series_url(key)?;
        let params = query_params(key, Utc::now())?;

        let response = self
            .client
            .get(url)
            .query(&params)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let rows: Vec<RawSample> = response.json().await.map_err(map_request_error)?;
        let total = rows.len();
        let (samples, issues) = parse_samples(rows);
        if let Some(first) = issues.first() {
            warn!(
                key = %key,
                dropped = issues.len(),
                total,
                first_issue = %first,
                "dropped invalid samples"
            );
        }
        debug!(key = %key, samples = samples.len(), "series fetched");
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Interval, Quality};
    use chrono::TimeZone;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one connection: records the request line and answers with
    /// `response`, or holds the connection open when it is `None`.
    async fn serve_once(response: Option<String>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            match response {
                Some(response) => {
                    conn.write_all(response.as_bytes()).await.unwrap();
                    let _ = conn.shutdown().await;
                }
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
            let request = String::from_utf8_lossy(&request);
            request.lines().next().unwrap_or_default().to_string()
        });
        (format!("http://{addr}/api"), server)
    }

    fn reply(status: &str, body: &str) -> Option<String> {
        Some(format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ))
    }

    // Loopback only; proxy settings from the environment must not apply.
    fn local_fetcher(base: &str, timeout: Duration) -> HttpFetcher {
        HttpFetcher {
            client: Client::builder().no_proxy().timeout(timeout).build().unwrap(),
            base_url: Url::parse(base).unwrap(),
        }
    }

    #[test]
    fn test_series_url_encodes_segments() {
        let fetcher = HttpFetcher::new("http://localhost:9000/api/", Duration::from_secs(5)).unwrap();
        let key = MetricKey::new("srv 1", "p99/latency");
        let url = fetcher.series_url(&key).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/api/resource/srv%201/series/p99%2Flatency/data"
        );
    }

    #[test]
    fn test_query_params() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let key = MetricKey::new("r", "s");
        assert!(query_params(&key, now).unwrap().is_empty());

        let key = key
            .with_lookback(Duration::from_secs(3600))
            .with_aggregation(Interval::Hour);
        let params = query_params(&key, now).unwrap();
        assert_eq!(
            params,
            vec![
                ("startDate", "2024-03-05T11:00:00.000Z".to_string()),
                ("endDate", "2024-03-05T12:00:00.000Z".to_string()),
                ("aggregation", "hour".to_string()),
            ]
        );
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(HttpFetcher::new("not a url", Duration::from_secs(1)).is_err());
        assert!(HttpFetcher::new("mailto:ops@example.com", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_fetch_keeps_valid_rows_in_order() {
        let body = r#"[
            {"id":"a","metricId":"cpu","value":1.5,"timestamp":"2024-01-01T00:00:00Z"},
            {"id":"bad","metricId":"cpu","timestamp":"2024-01-01T00:01:00Z"},
            {"id":"b","metricId":"cpu","value":2.5,"timestamp":"2024-01-01T00:02:00Z","quality":"warning"}
        ]"#;
        let (base, server) = serve_once(reply("200 OK", body)).await;
        let fetcher = local_fetcher(&base, Duration::from_secs(5));
        let key = MetricKey::new("host-1", "cpu").with_aggregation(Interval::Hour);

        let samples = fetcher.fetch(&key).await.unwrap();
        let ids: Vec<_> = samples.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(samples[0].value, 1.5);
        assert_eq!(samples[1].quality, Quality::Warning);

        assert_eq!(
            server.await.unwrap(),
            "GET /api/resource/host-1/series/cpu/data?aggregation=hour HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn test_fetch_maps_error_status() {
        let (base, _server) = serve_once(reply("503 Service Unavailable", "maintenance")).await;
        let fetcher = local_fetcher(&base, Duration::from_secs(5));
        let err = fetcher.fetch(&MetricKey::new("r", "s")).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Status {
                status: 503,
                message: "maintenance".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_maps_bad_json_to_decode() {
        let (base, _server) = serve_once(reply("200 OK", "{not json")).await;
        let fetcher = local_fetcher(&base, Duration::from_secs(5));
        let err = fetcher.fetch(&MetricKey::new("r", "s")).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let (base, _server) = serve_once(None).await;
        let fetcher = local_fetcher(&base, Duration::from_millis(200));
        let err = fetcher.fetch(&MetricKey::new("r", "s")).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout);
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = local_fetcher(&format!("http://{addr}/api"), Duration::from_secs(5));
        let err = fetcher.fetch(&MetricKey::new("r", "s")).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)), "{err:?}");
    }
}
