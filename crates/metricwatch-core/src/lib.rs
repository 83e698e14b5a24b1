//! metricwatch-core — polling, change detection and aggregation for metric series.
//!
//! Provides:
//! - `models` — samples, snapshots, notifications, metric keys
//! - `aggregate` — pure bucketing, normalization and outlier helpers
//! - `analysis` — change detection between consecutive snapshots
//! - `notify` — bounded, expiring notification registry
//! - `provider` — fetcher abstraction (HTTP and scripted mock)
//! - `activity` — foreground/background signal driving poll cadence
//! - `config` — polling and registry configuration
//! - `scheduler` — per-metric subscription loop
//! - `coordinator` — a set of subscriptions sharing one registry
//!
//! With `http` feature (default):
//! - `provider::HttpFetcher` — reqwest client for the series data endpoint
//!
//! With `api` feature:
//! - `utoipa::ToSchema` derives on the serializable types

pub mod activity;
pub mod aggregate;
pub mod analysis;
pub mod config;
pub mod coordinator;
pub mod models;
pub mod notify;
pub mod provider;
pub mod scheduler;

pub use activity::{ActivitySignal, ActivityState};
pub use config::{PollingConfig, RegistryConfig};
pub use coordinator::MultiMetricCoordinator;
pub use models::{ChangeNotification, Interval, MetricKey, Quality, Sample, Severity, Snapshot};
pub use notify::NotificationRegistry;
pub use provider::{FetchError, SampleFetcher};
pub use scheduler::{Callbacks, MetricStatus, Phase, Subscription};

/// Crate version with the git revision it was built from.
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("METRICWATCH_GIT_SHA"),
    ")"
);
