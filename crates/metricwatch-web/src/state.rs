//! Shared application state and global statics.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use axum::extract::State;
use tokio::sync::watch;

use metricwatch_core::MultiMetricCoordinator;

pub(crate) struct WebApp {
    pub(crate) coordinator: Arc<MultiMetricCoordinator>,
    // Flips to true once shutdown starts; long-lived responses end on it.
    shutdown: watch::Sender<bool>,
}

impl WebApp {
    pub(crate) fn new(coordinator: Arc<MultiMetricCoordinator>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            coordinator,
            shutdown,
        }
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

pub(crate) type SharedState = Arc<WebApp>;

pub(crate) type AppState = State<SharedState>;

pub(crate) static SSE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
