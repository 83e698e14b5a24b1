//! Per-metric polling subscription.
//!
//! [`Subscription::start`] spawns a task that fetches immediately, then
//! keeps polling at the interval selected by the activity signal. Failed
//! fetches are retried with exponential backoff; a cycle that exhausts its
//! retries ends degraded and the next tick starts over. Every successful
//! fetch is compared against the previous snapshot and significant changes
//! are written to the shared [`NotificationRegistry`].
//!
//! The handle never blocks on the task: it flips flags under the state
//! lock and wakes the task through `Notify` permits.

mod worker;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::info;

use crate::activity::ActivitySignal;
use crate::config::PollingConfig;
use crate::models::{MetricKey, Snapshot};
use crate::notify::NotificationRegistry;
use crate::provider::{FetchError, SampleFetcher};

use worker::Worker;

// ============================================================
// Callbacks
// ============================================================

pub type SuccessCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Observers invoked from the subscription task.
///
/// `on_error` fires on every failed attempt, not only the last one of a
/// cycle. Neither fires once the subscription is disposed.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl Fn(&Snapshot) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

// ============================================================
// Status
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Phase {
    /// Started but nothing fetched yet (or polling disabled).
    Idle,
    Fetching,
    /// Waiting out the backoff after the `attempt`-th failure.
    Retrying { attempt: u32 },
    /// The last cycle ran out of retries.
    Degraded,
    /// Last fetch succeeded; waiting for the next tick.
    Waiting,
    Disposed,
}

/// Point-in-time view of a subscription.
#[derive(Clone, Debug, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct MetricStatus {
    pub metric_id: String,
    pub key: String,
    #[cfg_attr(feature = "api", schema(value_type = Option<Snapshot>))]
    pub data: Option<Arc<Snapshot>>,
    /// Fetching with no data yet.
    pub is_loading: bool,
    pub error: Option<String>,
    /// Fetching while older data is available.
    pub is_refreshing: bool,
    pub retry_count: u32,
    pub is_visible: bool,
    pub phase: Phase,
    pub last_updated: Option<DateTime<Utc>>,
}

// ============================================================
// Shared state
// ============================================================

struct State {
    previous: Option<Arc<Snapshot>>,
    current: Option<Arc<Snapshot>>,
    /// A cycle (or forced fetch) is running, backoff waits included.
    fetching: bool,
    refresh_pending: bool,
    force_pending: bool,
    error: Option<String>,
    retry_count: u32,
    phase: Phase,
    last_updated: Option<DateTime<Utc>>,
    disposed: bool,
}

struct Shared {
    metric_id: String,
    key: MetricKey,
    config: PollingConfig,
    activity: ActivitySignal,
    state: Mutex<State>,
    refresh: Notify,
    force: Notify,
    shutdown: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the start of a polling cycle. False once disposed.
    fn begin_cycle(&self) -> bool {
        let mut st = self.state();
        if st.disposed {
            return false;
        }
        st.fetching = true;
        st.refresh_pending = false;
        st.retry_count = 0;
        st.phase = Phase::Fetching;
        true
    }

    /// Back from a backoff wait. False once disposed.
    fn resume_cycle(&self) -> bool {
        let mut st = self.state();
        if st.disposed {
            return false;
        }
        st.phase = Phase::Fetching;
        true
    }

    /// Marks the start of a forced fetch, returning the phase to fall back
    /// to if it fails.
    fn begin_forced(&self) -> Option<Phase> {
        let mut st = self.state();
        if st.disposed {
            return None;
        }
        st.force_pending = false;
        st.fetching = true;
        Some(std::mem::replace(&mut st.phase, Phase::Fetching))
    }
}

// ============================================================
// Subscription
// ============================================================

/// Live polling session for one metric.
///
/// Dropping the handle disposes the subscription.
pub struct Subscription {
    shared: Arc<Shared>,
}

impl Subscription {
    /// Spawns the polling task. Must be called from within a tokio runtime.
    pub fn start(
        metric_id: impl Into<String>,
        key: MetricKey,
        fetcher: Arc<dyn SampleFetcher>,
        config: PollingConfig,
        registry: Arc<NotificationRegistry>,
        activity: ActivitySignal,
        callbacks: Callbacks,
    ) -> Self {
        let metric_id = metric_id.into();
        info!(
            metric_id = %metric_id,
            key = %key,
            enabled = config.enabled,
            interval_ms = config.polling_interval.as_millis() as u64,
            background_interval_ms = config.background_polling_interval.as_millis() as u64,
            "subscription started"
        );

        let shared = Arc::new(Shared {
            metric_id,
            key,
            config,
            activity,
            state: Mutex::new(State {
                previous: None,
                current: None,
                fetching: false,
                refresh_pending: false,
                force_pending: false,
                error: None,
                retry_count: 0,
                phase: Phase::Idle,
                last_updated: None,
                disposed: false,
            }),
            refresh: Notify::new(),
            force: Notify::new(),
            shutdown: Notify::new(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            fetcher,
            registry,
            callbacks,
        };
        tokio::spawn(worker.run());

        Self { shared }
    }

    pub fn metric_id(&self) -> &str {
        &self.shared.metric_id
    }

    pub fn key(&self) -> &MetricKey {
        &self.shared.key
    }

    pub fn config(&self) -> &PollingConfig {
        &self.shared.config
    }

    /// Requests an out-of-band fetch. Ignored while a fetch is in flight or
    /// another refresh is already queued. Returns whether one was queued.
    pub fn refresh(&self) -> bool {
        {
            let mut st = self.shared.state();
            if st.disposed || st.fetching || st.refresh_pending {
                return false;
            }
            st.refresh_pending = true;
        }
        self.shared.refresh.notify_one();
        true
    }

    /// Requests a single fetch regardless of what is in flight; it runs
    /// right after the current one. Does not reset the retry counter.
    pub fn force_refresh(&self) -> bool {
        {
            let mut st = self.shared.state();
            if st.disposed || st.force_pending {
                return false;
            }
            st.force_pending = true;
        }
        self.shared.force.notify_one();
        true
    }

    /// Stops polling for good. A fetch already in flight may finish but its
    /// result is dropped.
    pub fn dispose(&self) {
        {
            let mut st = self.shared.state();
            if st.disposed {
                return;
            }
            st.disposed = true;
            st.fetching = false;
            st.phase = Phase::Disposed;
        }
        self.shared.shutdown.notify_one();
        info!(metric_id = %self.shared.metric_id, "subscription disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state().disposed
    }

    /// Latest snapshot, if any fetch has succeeded.
    pub fn data(&self) -> Option<Arc<Snapshot>> {
        self.shared.state().current.clone()
    }

    /// Snapshot before [`data`](Self::data).
    pub fn previous(&self) -> Option<Arc<Snapshot>> {
        self.shared.state().previous.clone()
    }

    pub fn status(&self) -> MetricStatus {
        let is_visible = self.shared.activity.current().is_active();
        let st = self.shared.state();
        MetricStatus {
            metric_id: self.shared.metric_id.clone(),
            key: self.shared.key.to_string(),
            data: st.current.clone(),
            is_loading: st.fetching && st.current.is_none(),
            error: st.error.clone(),
            is_refreshing: st.fetching && st.current.is_some(),
            retry_count: st.retry_count,
            is_visible,
            phase: st.phase,
            last_updated: st.last_updated,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}
