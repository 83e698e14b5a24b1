//! Scripted fetcher for tests and local demos.
//!
//! Responses are consumed in order from a per-key queue, then a shared
//! queue; when both are empty the per-key fallback (or the default) is
//! repeated. Every call is recorded with the tokio instant it started at,
//! so paused-clock tests can assert exact scheduling.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::models::{MetricKey, Sample};

use super::{FetchError, SampleFetcher};

#[derive(Clone, Debug)]
pub enum MockResponse {
    Samples(Vec<Sample>),
    Fail(FetchError),
    /// Holds the call open until the gate is notified.
    Gated(Arc<Notify>, Box<MockResponse>),
    /// Holds the call open for a fixed time.
    Delayed(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn fail(msg: impl Into<String>) -> Self {
        MockResponse::Fail(FetchError::Other(msg.into()))
    }

    pub fn gated(self, gate: Arc<Notify>) -> Self {
        MockResponse::Gated(gate, Box::new(self))
    }

    pub fn delayed(self, delay: Duration) -> Self {
        MockResponse::Delayed(delay, Box::new(self))
    }
}

#[derive(Clone, Debug)]
pub struct MockCall {
    pub key: MetricKey,
    pub at: Instant,
}

#[derive(Default)]
struct Script {
    shared: VecDeque<MockResponse>,
    per_key: HashMap<String, VecDeque<MockResponse>>,
    fallbacks: HashMap<String, MockResponse>,
}

pub struct MockFetcher {
    default: MockResponse,
    script: Mutex<Script>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockFetcher {
    /// Creates a fetcher that answers `default` once scripts run out.
    pub fn new(default: MockResponse) -> Self {
        Self {
            default,
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always returns `samples`.
    pub fn always(samples: Vec<Sample>) -> Self {
        Self::new(MockResponse::Samples(samples))
    }

    /// Always fails with `msg`.
    pub fn failing(msg: impl Into<String>) -> Self {
        Self::new(MockResponse::fail(msg))
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call_log(&self) -> MutexGuard<'_, Vec<MockCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a response for the next call on any key.
    pub fn push(&self, response: MockResponse) -> &Self {
        self.script().shared.push_back(response);
        self
    }

    /// Queues a response for the next call on `key`.
    pub fn push_for(&self, key: &MetricKey, response: MockResponse) -> &Self {
        self.script()
            .per_key
            .entry(key.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Replaces the repeating answer for `key`.
    pub fn set_fallback_for(&self, key: &MetricKey, response: MockResponse) -> &Self {
        self.script().fallbacks.insert(key.to_string(), response);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.call_log().clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_log().len()
    }

    pub fn calls_for(&self, key: &MetricKey) -> usize {
        self.call_log().iter().filter(|c| &c.key == key).count()
    }

    fn next_response(&self, key: &MetricKey) -> MockResponse {
        let name = key.to_string();
        let mut script = self.script();
        if let Some(r) = script.per_key.get_mut(&name).and_then(VecDeque::pop_front) {
            return r;
        }
        if let Some(r) = script.shared.pop_front() {
            return r;
        }
        script
            .fallbacks
            .get(&name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl SampleFetcher for MockFetcher {
    async fn fetch(&self, key: &MetricKey) -> Result<Vec<Sample>, FetchError> {
        self.call_log().push(MockCall {
            key: key.clone(),
            at: Instant::now(),
        });
        let mut response = self.next_response(key);
        loop {
            response = match response {
                MockResponse::Samples(samples) => return Ok(samples),
                MockResponse::Fail(e) => return Err(e),
                MockResponse::Gated(gate, inner) => {
                    gate.notified().await;
                    *inner
                }
                MockResponse::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    *inner
                }
            };
        }
    }
}

/// Builds a good-quality series for `metric_id`, one sample per minute
/// starting at 2024-01-01T00:00:00Z.
pub fn series(metric_id: &str, values: &[f64]) -> Vec<Sample> {
    let base: DateTime<Utc> = Utc.timestamp_opt(1_704_067_200, 0).single().unwrap_or_default();
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            Sample::new(
                format!("{metric_id}-{i}"),
                metric_id,
                *v,
                base + TimeDelta::minutes(i as i64),
            )
        })
        .collect()
}
