//! Fetcher abstraction for metric series sources.
//!
//! This module defines the `SampleFetcher` trait that lets subscriptions
//! poll any data source through one interface:
//! - `HttpFetcher`: the series data endpoint over HTTP (`http` feature)
//! - `MockFetcher`: scripted responses for tests and demos

#[cfg(feature = "http")]
mod http;
pub mod mock;

#[cfg(feature = "http")]
pub use http::HttpFetcher;
pub use mock::{MockFetcher, MockResponse};

use async_trait::async_trait;

use crate::models::{MetricKey, Sample};

/// Error types that can occur while fetching a series.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Connection-level failure (DNS, refused, reset).
    Transport(String),
    /// The request did not complete in time.
    Timeout,
    /// The source answered with a non-success status.
    Status { status: u16, message: String },
    /// The response body could not be decoded.
    Decode(String),
    /// Anything else reported by a fetcher implementation.
    Other(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transport(msg) => write!(f, "Transport error: {}", msg),
            FetchError::Timeout => write!(f, "Request timed out"),
            FetchError::Status { status, message } if message.is_empty() => {
                write!(f, "Source returned HTTP {}", status)
            }
            FetchError::Status { status, message } => {
                write!(f, "Source returned HTTP {}: {}", status, message)
            }
            FetchError::Decode(msg) => write!(f, "Decode error: {}", msg),
            FetchError::Other(msg) => write!(f, "Fetch error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

/// Source of samples for one metric key.
///
/// Implementations must be cheap to share: subscriptions hold them behind
/// an `Arc` and may call `fetch` from several tasks at once (one call per
/// subscription at a time).
#[async_trait]
pub trait SampleFetcher: Send + Sync {
    /// Returns the ordered samples currently available for `key`.
    async fn fetch(&self, key: &MetricKey) -> Result<Vec<Sample>, FetchError>;
}
