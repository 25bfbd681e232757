//! Server reachability probing.
//!
//! The session client never polls; callers that want a live "server
//! available" flag run a [`ConnectivityMonitor`] next to it.

use std::{sync::Arc, time::Duration};

use kernel_client_core::KernelApi;
use serde::Serialize;
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
};

/// Result of one reachability probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Connectivity {
    pub available: bool,
    pub active_kernels: usize,
}

impl Connectivity {
    const UNAVAILABLE: Self = Self {
        available: false,
        active_kernels: 0,
    };
}

/// List kernels once, bounded by `timeout`. Never fails; an unreachable
/// server is reported as unavailable.
pub async fn probe(api: &dyn KernelApi, timeout: Duration) -> Connectivity {
    match tokio::time::timeout(timeout, api.list_kernels()).await {
        Ok(Ok(kernels)) => Connectivity {
            available: true,
            active_kernels: kernels.len(),
        },
        Ok(Err(e)) => {
            tracing::warn!("Failed to fetch kernels: {e}");
            Connectivity::UNAVAILABLE
        }
        Err(_) => {
            tracing::warn!("Kernel list timed out after {timeout:?}");
            Connectivity::UNAVAILABLE
        }
    }
}

/// Background poller publishing the latest [`Connectivity`].
pub struct ConnectivityMonitor {
    state: watch::Receiver<Connectivity>,
    refresh: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Start polling `api` every `interval`.
    #[must_use]
    pub fn spawn(api: Arc<dyn KernelApi>, interval: Duration, probe_timeout: Duration) -> Self {
        let (tx, state) = watch::channel(Connectivity::default());
        let refresh = Arc::new(Notify::new());

        let wake = Arc::clone(&refresh);
        let task = tokio::spawn(async move {
            loop {
                let result = probe(api.as_ref(), probe_timeout).await;
                tx.send_if_modified(|current| {
                    let changed = *current != result;
                    if changed {
                        tracing::info!(
                            available = result.available,
                            active_kernels = result.active_kernels,
                            "Server connectivity changed"
                        );
                    }
                    *current = result;
                    changed
                });

                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = wake.notified() => {}
                }
            }
        });

        Self {
            state,
            refresh,
            task,
        }
    }

    /// Latest probe result.
    #[must_use]
    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    /// Receiver notified whenever the result changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.clone()
    }

    /// Probe again now instead of waiting for the next tick.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    /// Wait until the server is reported available.
    pub async fn wait_until_available(&self) -> Connectivity {
        let mut rx = self.state.clone();
        rx.wait_for(|c| c.available)
            .await
            .map_or(Connectivity::UNAVAILABLE, |c| *c)
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
