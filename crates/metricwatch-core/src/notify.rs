//! Bounded, expiring store of change notifications.
//!
//! At most one live notification per metric (last write wins) and at most
//! `capacity` across all metrics; the oldest entry is evicted first.
//! Entries older than the TTL are dropped by [`NotificationRegistry::sweep`],
//! which [`NotificationRegistry::spawn_sweeper`] runs on a fixed cadence.
//! Every accepted notification is also published to broadcast subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::RegistryConfig;
use crate::models::ChangeNotification;

struct Entry {
    notification: ChangeNotification,
    created_at: Instant,
    /// Insertion order; breaks ties between equal `created_at`.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// Buffered events per broadcast receiver before it starts lagging.
const EVENT_CAPACITY: usize = 64;

pub struct NotificationRegistry {
    config: RegistryConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ChangeNotification>,
}

impl NotificationRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Receives every notification added from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `notification`, replacing any entry for the same metric.
    pub fn add(&self, notification: ChangeNotification) {
        self.add_at(notification, Instant::now());
    }

    fn add_at(&self, notification: ChangeNotification, now: Instant) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            notification.metric_id.clone(),
            Entry {
                notification: notification.clone(),
                created_at: now,
                seq,
            },
        );

        while inner.entries.len() > self.config.capacity {
            let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.created_at, e.seq))
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            inner.entries.remove(&oldest);
            debug!(metric_id = %oldest, "notification evicted (registry full)");
        }

        // Sent under the lock so subscribers see writes in registry order.
        // No receivers is fine.
        let _ = self.events.send(notification);
    }

    /// Drops entries older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let ttl = self.config.ttl;
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| now.saturating_duration_since(e.created_at) < ttl);
        before - inner.entries.len()
    }

    /// Removes the notification for `metric_id`, if any.
    pub fn dismiss(&self, metric_id: &str) -> bool {
        self.lock().entries.remove(metric_id).is_some()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn get(&self, metric_id: &str) -> Option<ChangeNotification> {
        self.lock()
            .entries
            .get(metric_id)
            .map(|e| e.notification.clone())
    }

    /// Live notifications, newest first.
    pub fn notifications(&self) -> Vec<ChangeNotification> {
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries.into_iter().map(|e| e.notification.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Runs [`sweep`](Self::sweep) every `sweep_interval` until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.config.sweep_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let removed = registry.sweep();
                if removed > 0 {
                    debug!(removed, remaining = registry.len(), "expired notifications swept");
                }
            }
        })
    }
}

impl Default for NotificationRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::Utc;
    use std::time::Duration;

    fn note(metric: &str, pct: f64) -> ChangeNotification {
        ChangeNotification {
            metric_id: metric.to_string(),
            previous_value: 100.0,
            current_value: 100.0 + pct,
            change_percent: pct,
            timestamp: Utc::now(),
            severity: Severity::from_change_percent(pct),
        }
    }

    #[test]
    fn test_last_write_wins_per_metric() {
        let reg = NotificationRegistry::default();
        reg.add(note("cpu", 20.0));
        reg.add(note("cpu", 60.0));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("cpu").unwrap().change_percent, 60.0);
    }

    #[test]
    fn test_cap_evicts_globally_oldest() {
        let reg = NotificationRegistry::default();
        let t0 = Instant::now();
        for i in 0..10 {
            reg.add_at(note(&format!("m{i}"), 30.0), t0 + Duration::from_secs(i));
        }
        // Refresh m0 so m1 becomes the oldest.
        reg.add_at(note("m0", 40.0), t0 + Duration::from_secs(10));
        assert_eq!(reg.len(), 10);

        reg.add_at(note("m10", 30.0), t0 + Duration::from_secs(11));
        assert_eq!(reg.len(), 10);
        assert!(reg.get("m1").is_none());
        assert!(reg.get("m0").is_some());
        assert!(reg.get("m10").is_some());
    }

    #[test]
    fn test_cap_ties_broken_by_insertion_order() {
        let reg = NotificationRegistry::new(RegistryConfig::default().with_capacity(2));
        let t0 = Instant::now();
        reg.add_at(note("a", 30.0), t0);
        reg.add_at(note("b", 30.0), t0);
        reg.add_at(note("c", 30.0), t0);
        let ids: Vec<_> = reg.notifications().into_iter().map(|n| n.metric_id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let reg = NotificationRegistry::default();
        for i in 0..100 {
            reg.add(note(&format!("m{}", i % 37), 25.0));
            assert!(reg.len() <= 10);
        }
    }

    #[test]
    fn test_sweep_drops_expired() {
        let reg = NotificationRegistry::default();
        let t0 = Instant::now();
        reg.add_at(note("old", 30.0), t0);
        reg.add_at(note("fresh", 30.0), t0 + Duration::from_secs(20));
        assert_eq!(reg.sweep_at(t0 + Duration::from_secs(29)), 0);
        assert_eq!(reg.sweep_at(t0 + Duration::from_secs(30)), 1);
        assert!(reg.get("old").is_none());
        assert!(reg.get("fresh").is_some());
    }

    #[test]
    fn test_dismiss_and_clear() {
        let reg = NotificationRegistry::default();
        reg.add(note("a", 30.0));
        reg.add(note("b", 30.0));
        assert!(reg.dismiss("a"));
        assert!(!reg.dismiss("a"));
        assert_eq!(reg.len(), 1);
        reg.clear();
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_receive_added() {
        let reg = NotificationRegistry::default();
        let mut rx = reg.subscribe();
        reg.add(note("cpu", 30.0));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.metric_id, "cpu");
        assert_eq!(got.severity, Severity::Medium);
    }

    #[test]
    fn test_subscribers_see_registry_order() {
        let reg = Arc::new(NotificationRegistry::default());
        let mut rx = reg.subscribe();
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        reg.add(note("cpu", (w * 1000 + i) as f64));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut last = None;
        loop {
            match rx.try_recv() {
                Ok(n) => last = Some(n),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(
            last.unwrap().change_percent,
            reg.get("cpu").unwrap().change_percent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_entries() {
        let reg = Arc::new(NotificationRegistry::default());
        let sweeper = reg.spawn_sweeper();
        reg.add(note("cpu", 30.0));

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(reg.len(), 1);

        // Next sweep at or after the 30s mark removes it.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(reg.is_empty());
        sweeper.abort();
    }
}
