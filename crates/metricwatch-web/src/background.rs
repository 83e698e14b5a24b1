//! Background processing: activity signals, periodic summary, graceful shutdown.

use std::time::Duration;

use tracing::{debug, info, warn};

use metricwatch_core::{ActivitySignal, ActivityState};

use crate::state::SharedState;

// ============================================================
// Activity from Unix signals
// ============================================================

/// SIGUSR1 moves every subscription to the background cadence, SIGUSR2
/// back to the foreground one.
#[cfg(unix)]
pub(crate) async fn activity_signal_loop(activity: ActivitySignal) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut usr1, mut usr2) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(usr1), Ok(usr2)) => (usr1, usr2),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "failed to install SIGUSR1/SIGUSR2 handlers");
            return;
        }
    };

    loop {
        let state = tokio::select! {
            Some(()) = usr1.recv() => ActivityState::Inactive,
            Some(()) = usr2.recv() => ActivityState::Active,
            else => break,
        };
        if activity.set(state) {
            info!(state = ?state, "activity changed by signal");
        } else {
            debug!(state = ?state, "activity signal repeated");
        }
    }
}

#[cfg(not(unix))]
pub(crate) async fn activity_signal_loop(_activity: ActivitySignal) {}

// ============================================================
// Summary loop
// ============================================================

pub(crate) async fn summary_loop(state: SharedState, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick fires immediately; nothing has been fetched yet.
    tick.tick().await;

    loop {
        tick.tick().await;
        let statuses = state.coordinator.statuses();
        let failing = statuses.iter().filter(|s| s.error.is_some()).count();
        let pending = statuses.iter().filter(|s| s.data.is_none()).count();
        info!(
            subscriptions = statuses.len(),
            failing,
            pending,
            notifications = state.coordinator.registry().len(),
            activity = ?state.coordinator.activity().current(),
            "status summary"
        );
    }
}

// ============================================================
// Shutdown
// ============================================================

async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Ends open event streams and disposes every subscription, so graceful
/// shutdown is not held up by long-lived connections.
pub(crate) fn begin_shutdown(state: &SharedState) {
    state.begin_shutdown();
    state.coordinator.dispose_all();
}

/// Resolves on Ctrl-C or SIGTERM after calling [`begin_shutdown`].
pub(crate) async fn shutdown_signal(state: SharedState) {
    wait_for_termination().await;
    info!("Received shutdown signal");
    begin_shutdown(&state);
}
