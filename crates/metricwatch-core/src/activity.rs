//! Foreground/background signal that selects the polling cadence.
//!
//! The signal is injected into every subscription so scheduling can be
//! driven by anything: an HTTP call, a Unix signal, or a test.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    #[default]
    Active,
    Inactive,
}

impl ActivityState {
    pub fn is_active(self) -> bool {
        self == ActivityState::Active
    }
}

/// Shared, cloneable activity signal.
///
/// All clones observe the same state. Subscribers get a `watch::Receiver`
/// and wake on every transition.
#[derive(Clone, Debug)]
pub struct ActivitySignal {
    tx: Arc<watch::Sender<ActivityState>>,
}

impl ActivitySignal {
    pub fn new(initial: ActivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> ActivityState {
        *self.tx.borrow()
    }

    /// Publishes `state`. Returns true if this was a transition.
    pub fn set(&self, state: ActivityState) -> bool {
        self.tx.send_if_modified(|cur| {
            if *cur == state {
                false
            } else {
                *cur = state;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ActivityState> {
        self.tx.subscribe()
    }
}

impl Default for ActivitySignal {
    fn default() -> Self {
        Self::new(ActivityState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_transitions_only() {
        let signal = ActivitySignal::default();
        assert!(signal.current().is_active());
        assert!(!signal.set(ActivityState::Active));
        assert!(signal.set(ActivityState::Inactive));
        assert_eq!(signal.current(), ActivityState::Inactive);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let signal = ActivitySignal::default();
        let mut rx = signal.clone().subscribe();
        signal.set(ActivityState::Inactive);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ActivityState::Inactive);
    }

    #[test]
    fn test_state_json() {
        let json = serde_json::to_string(&ActivityState::Inactive).unwrap();
        assert_eq!(json, "\"inactive\"");
    }
}
