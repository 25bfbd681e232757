//! Session client for one remote kernel.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::stream::BoxStream;
use kernel_client_core::{
    ChannelConnector, Envelope, ExecutionRequest, ImageArena, KernelApi, KernelInfo, MsgId,
    OutputItem, SessionError, SessionOptions, SessionStatus, Subscription, TransportError,
    tracker::ShutdownStep,
};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::router::{self, Shared};

/// How a finished execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub request_id: MsgId,
    /// The kernel reported an exception for this request.
    pub errored: bool,
    pub elapsed: Duration,
}

/// Completion handle returned by [`SessionClient::run_code`].
///
/// Dropping it does not cancel the request; output keeps flowing to
/// subscribers until the kernel goes idle.
#[derive(Debug)]
pub struct PendingExecution {
    request_id: MsgId,
    rx: oneshot::Receiver<Result<ExecutionOutcome, SessionError>>,
}

impl PendingExecution {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the kernel to finish this request.
    ///
    /// # Errors
    /// Returns `Abandoned` if the session shut down first, or the error that
    /// terminated the session.
    pub async fn finished(self) -> Result<ExecutionOutcome, SessionError> {
        self.rx.await.unwrap_or(Err(SessionError::Abandoned))
    }
}

/// Live connection to a kernel.
struct Link {
    kernel: KernelInfo,
    outbound: tokio::sync::mpsc::UnboundedSender<String>,
    stop: CancellationToken,
    router: JoinHandle<()>,
}

/// Client for one remote kernel session.
///
/// At most one execution is in flight at a time. Output of the current
/// execution is delivered to subscribers registered with
/// [`on_output_item`](Self::on_output_item) in arrival order.
pub struct SessionClient {
    api: Arc<dyn KernelApi>,
    connector: Arc<dyn ChannelConnector>,
    options: SessionOptions,
    session_id: String,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl SessionClient {
    /// Create a client talking to a Jupyter server over HTTP and WebSocket.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    #[cfg(feature = "websocket")]
    pub fn new(
        config: kernel_client_core::ServerConfig,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let api = kernel_client_transport::RestClient::new(config.clone(), options.timeouts)?;
        let connector =
            kernel_client_transport::WsConnector::new(config, options.timeouts.channel_open);
        Ok(Self::with_transport(
            Arc::new(api),
            Arc::new(connector),
            options,
        ))
    }

    /// Create a client over arbitrary transports.
    #[must_use]
    pub fn with_transport(
        api: Arc<dyn KernelApi>,
        connector: Arc<dyn ChannelConnector>,
        options: SessionOptions,
    ) -> Self {
        Self {
            api,
            connector,
            options,
            session_id: uuid::Uuid::new_v4().to_string(),
            shared: Arc::new(Shared::new()),
            link: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a kernel and open its channel.
    ///
    /// Idempotent: once the session is up, later calls return the same
    /// kernel without touching the server. A failed attempt leaves this
    /// client terminated.
    ///
    /// # Errors
    /// Returns `Connection` or `Timeout` if the kernel cannot be created or
    /// its channel cannot be opened, `Terminated` after shutdown.
    pub async fn initiate(&self) -> Result<KernelInfo, SessionError> {
        let _guard = self.lifecycle.lock().await;
        if self.status().is_terminal() {
            return Err(self.shared.termination_error());
        }
        if let Some(kernel) = self.kernel() {
            return Ok(kernel);
        }
        self.shared.update(|s| s.tracker.begin_start())?;
        tracing::info!(session_id = %self.session_id, "Starting kernel session");

        let link = match self.connect().await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!("Kernel session failed to start: {e}");
                self.shared.update(|s| s.tracker.terminate());
                self.shared.bus.close();
                return Err(e);
            }
        };

        let kernel = link.kernel.clone();
        *self.lock_link() = Some(link);
        if let Err(e) = self.shared.update(|s| s.tracker.mark_ready()) {
            // The channel died between opening and now.
            self.teardown().await;
            return Err(match e {
                SessionError::Terminated => self.shared.termination_error(),
                other => other,
            });
        }

        tracing::info!(kernel_id = %kernel.id, "Kernel session ready");
        Ok(kernel)
    }

    async fn connect(&self) -> Result<Link, SessionError> {
        let timeouts = self.options.timeouts;
        let kernel = tokio::time::timeout(timeouts.create, self.api.create_kernel())
            .await
            .map_err(|_| {
                SessionError::Timeout(format!("kernel creation exceeded {:?}", timeouts.create))
            })??;
        tracing::info!(kernel_id = %kernel.id, "Kernel created");

        let opened = tokio::time::timeout(
            timeouts.channel_open,
            self.connector.open(&kernel.id, &self.session_id),
        )
        .await;
        let channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                self.delete_kernel(&kernel.id).await;
                return Err(e.into());
            }
            Err(_) => {
                self.delete_kernel(&kernel.id).await;
                return Err(SessionError::Timeout(format!(
                    "channel open exceeded {:?}",
                    timeouts.channel_open
                )));
            }
        };
        tracing::info!(kernel_id = %kernel.id, "Kernel channel open");

        let stop = CancellationToken::new();
        let router = tokio::spawn(router::run(
            Arc::clone(&self.shared),
            channel.inbound,
            stop.clone(),
        ));

        Ok(Link {
            kernel,
            outbound: channel.outbound,
            stop,
            router,
        })
    }

    /// Send `code` to the kernel.
    ///
    /// Output arrives through subscribers; the returned handle resolves
    /// when the kernel reports idle for this request.
    ///
    /// # Errors
    /// Returns `Busy` while another execution is outstanding, `NotReady`
    /// before [`initiate`](Self::initiate) completes, `Terminated` or
    /// `ConnectionLost` once the session is gone.
    pub fn run_code(&self, code: &str) -> Result<PendingExecution, SessionError> {
        let outbound = self
            .lock_link()
            .as_ref()
            .map(|link| link.outbound.clone());
        let Some(outbound) = outbound else {
            return Err(match self.status() {
                SessionStatus::Uninitiated | SessionStatus::Starting => SessionError::NotReady,
                _ => self.shared.termination_error(),
            });
        };

        let request = Envelope::execute_request(&self.session_id, code);
        let frame = request.to_frame()?;
        let request_id = request.msg_id().to_string();
        let retain_images = self.options.retain_images;

        let (tx, rx) = oneshot::channel();
        self.shared.update(|s| {
            s.tracker
                .begin_execution(ExecutionRequest::new(request_id.clone(), code))?;
            s.completion = Some(tx);
            if !retain_images {
                s.images.retain_only(&request_id);
            }
            Ok::<_, SessionError>(())
        })
        .map_err(|e| match e {
            SessionError::Terminated => self.shared.termination_error(),
            other => other,
        })?;

        if outbound.send(frame).is_err() {
            // The writer is gone, so the channel is too. Terminating also
            // abandons the request, without a transient Idle.
            self.shared
                .fail(SessionError::ConnectionLost(TransportError::Closed.to_string()));
            return Err(self.shared.termination_error());
        }
        tracing::debug!(request_id = %request_id, "Execute request sent");

        Ok(PendingExecution { request_id, rx })
    }

    /// Register `callback` for every output item of the current execution.
    ///
    /// Callbacks run on the router task and must not block. After shutdown
    /// the returned subscription is inert.
    pub fn on_output_item<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OutputItem) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(callback)
    }

    /// Output items as an async stream. Ends at shutdown.
    #[must_use]
    pub fn output_stream(&self) -> BoxStream<'static, OutputItem> {
        self.shared.bus.stream()
    }

    /// Wait until no execution is outstanding.
    ///
    /// Resolves on the next return to idle even if another execution has
    /// already been started by the time this call wakes.
    ///
    /// # Errors
    /// Returns `NotReady` before [`initiate`](Self::initiate), or the
    /// termination error if the session ends while waiting.
    pub async fn wait_until_idle(&self) -> Result<(), SessionError> {
        self.shared.wait_idle().await
    }

    /// Ask the kernel to interrupt the outstanding execution.
    ///
    /// Best effort: returns `Ok(false)` when nothing is running or the
    /// server did not accept the interrupt.
    ///
    /// # Errors
    /// Returns `NotReady` before [`initiate`](Self::initiate), or the
    /// termination error once the session is gone.
    pub async fn interrupt(&self) -> Result<bool, SessionError> {
        let Some(kernel_id) = self.kernel_id() else {
            return Err(match self.status() {
                SessionStatus::Uninitiated | SessionStatus::Starting => SessionError::NotReady,
                _ => self.shared.termination_error(),
            });
        };
        if self.status() != SessionStatus::Busy {
            return Ok(false);
        }

        Ok(self.request_interrupt(&kernel_id).await)
    }

    /// Release the kernel and end the session.
    ///
    /// Never fails and is idempotent. An outstanding execution is abandoned:
    /// its [`PendingExecution`] resolves to `Abandoned`, the kernel is asked
    /// to interrupt it, and none of its remaining output is delivered.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;

        let step = self.shared.update(|s| {
            let step = s.tracker.begin_shutdown();
            if let Some(tx) = s.completion.take() {
                let _ = tx.send(Err(SessionError::Abandoned));
            }
            step
        });
        self.shared.bus.close();

        if let ShutdownStep::Proceed {
            abandoned: Some(request),
        } = &step
        {
            tracing::info!(request_id = %request.msg_id, "Abandoning outstanding execution");
            if let Some(kernel_id) = self.kernel_id() {
                self.request_interrupt(&kernel_id).await;
            }
        }
        // Still connected after a channel failure: release the kernel now.
        let released = self.teardown().await;

        self.shared.update(|s| {
            s.tracker.terminate();
            s.images.clear();
        });
        if released || matches!(step, ShutdownStep::Proceed { .. }) {
            tracing::info!(session_id = %self.session_id, "Kernel session shut down");
        } else {
            tracing::debug!("Kernel session already shut down");
        }
    }

    async fn request_interrupt(&self, kernel_id: &str) -> bool {
        let timeout = self.options.timeouts.shutdown;
        match tokio::time::timeout(timeout, self.api.interrupt_kernel(kernel_id)).await {
            Ok(Ok(())) => {
                tracing::info!(kernel_id, "Kernel interrupted");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(kernel_id, "Failed to interrupt kernel: {e}");
                false
            }
            Err(_) => {
                tracing::warn!(kernel_id, "Kernel interrupt timed out after {timeout:?}");
                false
            }
        }
    }

    /// Stop the router, close the channel and delete the kernel. Returns
    /// whether there was anything to release.
    async fn teardown(&self) -> bool {
        let Some(link) = self.lock_link().take() else {
            return false;
        };
        link.stop.cancel();
        drop(link.outbound);

        let timeout = self.options.timeouts.shutdown;
        if tokio::time::timeout(timeout, link.router).await.is_err() {
            tracing::warn!("Router did not stop within {timeout:?}");
        }
        self.delete_kernel(&link.kernel.id).await;
        true
    }

    async fn delete_kernel(&self, kernel_id: &str) {
        let timeout = self.options.timeouts.shutdown;
        match tokio::time::timeout(timeout, self.api.delete_kernel(kernel_id)).await {
            Ok(Ok(())) => tracing::info!(kernel_id, "Kernel deleted"),
            Ok(Err(e)) => tracing::warn!(kernel_id, "Failed to delete kernel: {e}"),
            Err(_) => tracing::warn!(kernel_id, "Kernel delete timed out after {timeout:?}"),
        }
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kernel(&self) -> Option<KernelInfo> {
        self.lock_link().as_ref().map(|link| link.kernel.clone())
    }

    /// Id of the kernel, once initiated and until shutdown.
    #[must_use]
    pub fn kernel_id(&self) -> Option<String> {
        self.lock_link().as_ref().map(|link| link.kernel.id.clone())
    }

    /// Client session id sent in every message header.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.subscribe_status()
    }

    /// Read access to image payloads referenced by
    /// [`OutputItem::DisplayImage`] keys.
    pub fn images<R>(&self, f: impl FnOnce(&ImageArena) -> R) -> R {
        self.shared.read(|s| f(&s.images))
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        let link = self
            .link
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(link) = link {
            link.stop.cancel();
            tracing::warn!(
                kernel_id = %link.kernel.id,
                "Session client dropped without shutdown; kernel left running"
            );
        }
    }
}
