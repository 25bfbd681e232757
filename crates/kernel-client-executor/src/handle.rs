//! The notebook's current kernel session, replaced on restart.
//!
//! A session that failed is never reused. [`SessionHandle::restart`] shuts
//! it down and starts a fresh client, but only while the server is reported
//! available.

use std::sync::{Arc, Mutex, PoisonError};

use kernel_client_core::{ServerConfig, SessionError, SessionOptions};
use kernel_client_session::SessionClient;
use kernel_client_transport::Connectivity;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type ClientFactory = Box<dyn Fn() -> Result<SessionClient, SessionError> + Send + Sync>;

/// Owner of at most one live [`SessionClient`].
pub struct SessionHandle {
    factory: ClientFactory,
    current: Mutex<Option<Arc<SessionClient>>>,
    restarting: tokio::sync::Mutex<()>,
}

impl SessionHandle {
    /// Handle whose sessions talk to the server in `config`.
    #[must_use]
    pub fn new(config: ServerConfig, options: SessionOptions) -> Self {
        Self::with_factory(move || SessionClient::new(config.clone(), options))
    }

    /// Handle building each new client with `factory`.
    #[must_use]
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Result<SessionClient, SessionError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            current: Mutex::new(None),
            restarting: tokio::sync::Mutex::new(()),
        }
    }

    /// The current client, if one was started.
    #[must_use]
    pub fn client(&self) -> Option<Arc<SessionClient>> {
        self.lock().clone()
    }

    /// Shut down the current client, then start a new one if the server is
    /// available. Returns `None` when it is not.
    ///
    /// # Errors
    /// Returns the new client's error if it cannot be built or initiated;
    /// the handle then holds no client.
    pub async fn restart(
        &self,
        connectivity: Connectivity,
    ) -> Result<Option<Arc<SessionClient>>, SessionError> {
        let _guard = self.restarting.lock().await;
        self.replace(connectivity).await
    }

    /// Like [`restart`](Self::restart), but keeps a client that is still
    /// usable.
    ///
    /// # Errors
    /// Same as [`restart`](Self::restart).
    pub async fn ensure(
        &self,
        connectivity: Connectivity,
    ) -> Result<Option<Arc<SessionClient>>, SessionError> {
        let _guard = self.restarting.lock().await;
        if let Some(client) = self.client().filter(|c| !c.status().is_terminal()) {
            return Ok(Some(client));
        }
        self.replace(connectivity).await
    }

    async fn replace(
        &self,
        connectivity: Connectivity,
    ) -> Result<Option<Arc<SessionClient>>, SessionError> {
        let previous = self.lock().take();
        if let Some(previous) = previous {
            tracing::info!(kernel_id = ?previous.kernel_id(), "Replacing kernel session");
            previous.shutdown().await;
        }
        if !connectivity.available {
            tracing::info!("Server unavailable; no kernel session started");
            return Ok(None);
        }

        let client = Arc::new((self.factory)()?);
        client.initiate().await?;
        *self.lock() = Some(Arc::clone(&client));
        Ok(Some(client))
    }

    /// Keep a session up whenever `connectivity` reports the server
    /// available, until `stop` fires.
    ///
    /// A client that terminates is replaced on the spot.
    pub async fn maintain(
        &self,
        mut connectivity: watch::Receiver<Connectivity>,
        stop: &CancellationToken,
    ) {
        loop {
            let current = *connectivity.borrow_and_update();
            if let Err(e) = self.ensure(current).await {
                tracing::warn!("Failed to start kernel session: {e}");
            }

            let client = self.client();
            let terminated = async move {
                match client {
                    Some(client) => {
                        let mut status = client.subscribe_status();
                        let _ = status.wait_for(|s| s.is_terminal()).await;
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = stop.cancelled() => return,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = terminated => {
                    tracing::info!("Kernel session ended; restarting");
                }
            }
        }
    }

    /// Shut down the current client, if any.
    pub async fn shutdown(&self) {
        let _guard = self.restarting.lock().await;
        let current = self.lock().take();
        if let Some(client) = current {
            client.shutdown().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<SessionClient>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
