//! Polling and registry configuration.

use std::time::Duration;

use crate::activity::ActivityState;

/// Upper bound for a single retry backoff wait.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Per-subscription polling configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PollingConfig {
    /// When false the subscription never fetches on its own;
    /// explicit refreshes still run.
    pub enabled: bool,
    /// Interval while the activity signal reports active.
    pub polling_interval: Duration,
    /// Interval while the activity signal reports inactive.
    pub background_polling_interval: Duration,
    /// Minimum change (percent) that produces a notification.
    pub change_threshold: f64,
    /// Failed attempts allowed per cycle before it ends degraded.
    pub max_retries: u32,
    /// Base backoff; doubles after every failure, capped at [`MAX_RETRY_DELAY`].
    pub retry_delay: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            polling_interval: Duration::from_millis(30_000),
            background_polling_interval: Duration::from_millis(120_000),
            change_threshold: 20.0,
            max_retries: 3,
            retry_delay: Duration::from_millis(1_000),
        }
    }
}

impl PollingConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_intervals(mut self, active: Duration, background: Duration) -> Self {
        self.polling_interval = active;
        self.background_polling_interval = background;
        self
    }

    pub fn with_change_threshold(mut self, percent: f64) -> Self {
        self.change_threshold = percent;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Poll interval for the given activity state.
    pub fn interval_for(&self, state: ActivityState) -> Duration {
        match state {
            ActivityState::Active => self.polling_interval,
            ActivityState::Inactive => self.background_polling_interval,
        }
    }

    /// Backoff before the retry that follows the `failures`-th failure.
    pub fn retry_backoff(&self, failures: u32) -> Duration {
        retry_backoff(self.retry_delay, failures)
    }
}

/// `base × 2^(failures-1)`, capped at [`MAX_RETRY_DELAY`].
pub fn retry_backoff(base: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp)
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

/// Notification registry limits.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryConfig {
    /// Maximum live notifications across all metrics.
    pub capacity: usize,
    /// Age after which a sweep drops a notification.
    pub ttl: Duration,
    /// Cadence of the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}
