//! The task behind a [`Subscription`](super::Subscription).
//!
//! One worker per subscription. It runs cycles strictly one after another,
//! so a fetch never starts before the previous one's effects are applied,
//! and creates a fresh sleep for every wait.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::activity::ActivityState;
use crate::analysis::detect_changes;
use crate::models::{Sample, Snapshot};
use crate::notify::NotificationRegistry;
use crate::provider::{FetchError, SampleFetcher};

use super::{Callbacks, Phase, Shared};

enum Wake {
    Tick,
    Activity,
    Refresh,
    Force,
    Shutdown,
}

pub(super) struct Worker {
    pub(super) shared: Arc<Shared>,
    pub(super) fetcher: Arc<dyn SampleFetcher>,
    pub(super) registry: Arc<NotificationRegistry>,
    pub(super) callbacks: Callbacks,
}

impl Worker {
    pub(super) async fn run(self) {
        let mut activity = self.shared.activity.subscribe();

        if self.shared.config.enabled {
            self.cycle().await;
        }

        loop {
            if self.shared.state().disposed {
                break;
            }
            match self.wait(&mut activity).await {
                Wake::Shutdown => break,
                Wake::Tick => self.cycle().await,
                Wake::Activity => {
                    let state = *activity.borrow_and_update();
                    let interval = self.shared.config.interval_for(state);
                    debug!(
                        metric_id = %self.shared.metric_id,
                        activity = ?state,
                        interval_ms = interval.as_millis() as u64,
                        "activity changed, refetching"
                    );
                    self.cycle().await;
                }
                Wake::Refresh => {
                    if self.shared.state().refresh_pending {
                        self.cycle().await;
                    }
                }
                Wake::Force => self.forced().await,
            }
        }

        debug!(metric_id = %self.shared.metric_id, "subscription task stopped");
    }

    /// Parks until the next reason to fetch.
    async fn wait(&self, activity: &mut watch::Receiver<ActivityState>) -> Wake {
        let shared = &self.shared;

        if !shared.config.enabled {
            return tokio::select! {
                biased;
                _ = shared.shutdown.notified() => Wake::Shutdown,
                _ = shared.force.notified() => Wake::Force,
                _ = shared.refresh.notified() => Wake::Refresh,
            };
        }

        // `borrow` leaves a transition that happened mid-cycle unseen, so
        // `changed` below fires for it right away.
        let interval = shared.config.interval_for(*activity.borrow());
        tokio::select! {
            biased;
            _ = shared.shutdown.notified() => Wake::Shutdown,
            _ = shared.force.notified() => Wake::Force,
            _ = shared.refresh.notified() => Wake::Refresh,
            Ok(()) = activity.changed() => Wake::Activity,
            _ = tokio::time::sleep(interval) => Wake::Tick,
        }
    }

    /// One polling cycle: fetch, retrying with backoff up to `max_retries`
    /// failed attempts.
    async fn cycle(&self) {
        if !self.shared.begin_cycle() {
            return;
        }

        let max_retries = self.shared.config.max_retries;
        let mut failures = 0u32;
        loop {
            let t0 = Instant::now();
            let result = self.fetcher.fetch(&self.shared.key).await;
            let elapsed_ms = t0.elapsed().as_millis() as u64;

            let err = match result {
                Ok(samples) => {
                    self.succeed(samples, elapsed_ms);
                    return;
                }
                Err(e) => e,
            };

            failures += 1;
            let retry = failures < max_retries;
            let phase = if retry {
                Phase::Retrying { attempt: failures }
            } else {
                Phase::Degraded
            };
            if !self.fail(&err, Some(failures), phase, !retry) {
                return;
            }

            if !retry {
                warn!(
                    metric_id = %self.shared.metric_id,
                    attempts = failures,
                    error = %err,
                    "retries exhausted, waiting for next tick"
                );
                return;
            }

            let delay = self.shared.config.retry_backoff(failures);
            warn!(
                metric_id = %self.shared.metric_id,
                attempt = failures,
                max_retries,
                retry_in_ms = delay.as_millis() as u64,
                duration_ms = elapsed_ms,
                error = %err,
                "fetch failed"
            );
            tokio::select! {
                _ = self.shared.shutdown.notified() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.shared.resume_cycle() {
                return;
            }
        }
    }

    /// A single attempt that leaves the retry counter alone.
    async fn forced(&self) {
        let Some(prior) = self.shared.begin_forced() else {
            return;
        };

        let t0 = Instant::now();
        let result = self.fetcher.fetch(&self.shared.key).await;
        let elapsed_ms = t0.elapsed().as_millis() as u64;

        match result {
            Ok(samples) => self.succeed(samples, elapsed_ms),
            Err(err) => {
                if self.fail(&err, None, prior, true) {
                    warn!(
                        metric_id = %self.shared.metric_id,
                        duration_ms = elapsed_ms,
                        error = %err,
                        "forced fetch failed"
                    );
                }
            }
        }
    }

    /// Swaps in the new snapshot and records changes. Discarded when the
    /// subscription was disposed while the fetch was in flight.
    fn succeed(&self, samples: Vec<Sample>, elapsed_ms: u64) {
        let shared = &self.shared;
        let snapshot = Arc::new(Snapshot::new(samples));

        let changes = {
            let mut st = shared.state();
            if st.disposed {
                debug!(metric_id = %shared.metric_id, "late result discarded");
                return;
            }
            let previous = st.current.replace(Arc::clone(&snapshot));
            st.previous = previous;
            st.retry_count = 0;
            st.error = None;
            st.fetching = false;
            st.phase = Phase::Waiting;
            st.last_updated = Some(snapshot.fetched_at);

            let changes = st
                .previous
                .as_deref()
                .map(|prev| detect_changes(prev, &snapshot, shared.config.change_threshold))
                .unwrap_or_default();
            for change in &changes {
                self.registry.add(change.clone());
            }
            changes
        };

        if changes.is_empty() {
            debug!(
                metric_id = %shared.metric_id,
                samples = snapshot.len(),
                duration_ms = elapsed_ms,
                "fetch completed"
            );
        } else {
            info!(
                metric_id = %shared.metric_id,
                samples = snapshot.len(),
                changes = changes.len(),
                duration_ms = elapsed_ms,
                "significant change detected"
            );
        }

        if let Some(cb) = &self.callbacks.on_success {
            cb(snapshot.as_ref());
        }
    }

    /// Records a failed attempt. `retry_count` of `None` keeps the counter.
    /// Returns false when the subscription is disposed.
    fn fail(&self, err: &FetchError, retry_count: Option<u32>, phase: Phase, done: bool) -> bool {
        {
            let mut st = self.shared.state();
            if st.disposed {
                return false;
            }
            if let Some(n) = retry_count {
                st.retry_count = n;
            }
            st.error = Some(err.to_string());
            st.phase = phase;
            if done {
                st.fetching = false;
            }
        }

        if let Some(cb) = &self.callbacks.on_error {
            cb(err);
        }
        true
    }
}
