//! A set of subscriptions sharing one fetcher, registry and activity signal.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::activity::ActivitySignal;
use crate::config::PollingConfig;
use crate::models::{MetricKey, Snapshot};
use crate::notify::NotificationRegistry;
use crate::provider::SampleFetcher;
use crate::scheduler::{Callbacks, MetricStatus, Subscription};

/// Owns one [`Subscription`] per metric id.
///
/// Subscriptions share nothing mutable except the notification registry,
/// so a failing or disposed metric never affects the others. Dropping the
/// coordinator disposes every subscription.
pub struct MultiMetricCoordinator {
    fetcher: Arc<dyn SampleFetcher>,
    registry: Arc<NotificationRegistry>,
    activity: ActivitySignal,
    config: PollingConfig,
    subscriptions: Mutex<BTreeMap<String, Subscription>>,
}

impl MultiMetricCoordinator {
    pub fn new(
        fetcher: Arc<dyn SampleFetcher>,
        registry: Arc<NotificationRegistry>,
        activity: ActivitySignal,
        config: PollingConfig,
    ) -> Self {
        Self {
            fetcher,
            registry,
            activity,
            config,
            subscriptions: Mutex::new(BTreeMap::new()),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, BTreeMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &Arc<NotificationRegistry> {
        &self.registry
    }

    pub fn activity(&self) -> &ActivitySignal {
        &self.activity
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Starts polling `key` as metric `id` with the shared config.
    /// An existing subscription with the same id is disposed and replaced.
    pub fn subscribe(&self, id: impl Into<String>, key: MetricKey) {
        self.subscribe_with(id, key, self.config.clone(), Callbacks::default());
    }

    pub fn subscribe_with(
        &self,
        id: impl Into<String>,
        key: MetricKey,
        config: PollingConfig,
        callbacks: Callbacks,
    ) {
        let id = id.into();
        let sub = Subscription::start(
            id.clone(),
            key,
            Arc::clone(&self.fetcher),
            config,
            Arc::clone(&self.registry),
            self.activity.clone(),
            callbacks,
        );
        if let Some(old) = self.subscriptions().insert(id.clone(), sub) {
            old.dispose();
            info!(metric_id = %id, "subscription replaced");
        }
    }

    /// Disposes and forgets `id`. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: &str) -> bool {
        match self.subscriptions().remove(id) {
            Some(sub) => {
                sub.dispose();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscriptions().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions().is_empty()
    }

    /// Subscribed ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.subscriptions().keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<MetricStatus> {
        self.subscriptions().get(id).map(Subscription::status)
    }

    pub fn data(&self, id: &str) -> Option<Arc<Snapshot>> {
        self.subscriptions().get(id).and_then(Subscription::data)
    }

    pub fn statuses(&self) -> Vec<MetricStatus> {
        self.subscriptions()
            .values()
            .map(Subscription::status)
            .collect()
    }

    /// `None` if `id` is unknown, otherwise whether a fetch was queued.
    pub fn refresh(&self, id: &str) -> Option<bool> {
        self.subscriptions().get(id).map(Subscription::refresh)
    }

    pub fn force_refresh(&self, id: &str) -> Option<bool> {
        self.subscriptions().get(id).map(Subscription::force_refresh)
    }

    /// Calls `refresh` on every subscription; returns how many queued a fetch.
    pub fn refresh_all(&self) -> usize {
        self.subscriptions()
            .values()
            .filter(|s| s.refresh())
            .count()
    }

    pub fn force_refresh_all(&self) -> usize {
        self.subscriptions()
            .values()
            .filter(|s| s.force_refresh())
            .count()
    }

    pub fn is_any_loading(&self) -> bool {
        self.statuses().iter().any(|s| s.is_loading)
    }

    pub fn is_any_error(&self) -> bool {
        self.statuses().iter().any(|s| s.error.is_some())
    }

    pub fn is_any_refreshing(&self) -> bool {
        self.statuses().iter().any(|s| s.is_refreshing)
    }

    /// Disposes and removes every subscription.
    pub fn dispose_all(&self) {
        let subs = std::mem::take(&mut *self.subscriptions());
        let count = subs.len();
        for sub in subs.values() {
            sub.dispose();
        }
        if count > 0 {
            info!(count, "all subscriptions disposed");
        }
    }
}
