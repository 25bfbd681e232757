//! In-process kernel with scripted replies.
//!
//! [`MemoryKernel`] implements both [`KernelApi`] and [`ChannelConnector`]
//! without a server. Each execute request is answered with `busy`, the
//! `execute_input` echo, the steps scripted for its code, then `idle`, all
//! parented to the request. Unscripted code produces no output.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use kernel_client_core::{
    ChannelConnector, Envelope, KernelApi, KernelChannel, KernelInfo, TransportError,
};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

/// One thing a scripted execution does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Send an iopub message parented to the request.
    Reply { msg_type: String, content: Value },
    /// Wait for [`MemoryKernel::release`] or an interrupt. An interrupt
    /// raises `KeyboardInterrupt` and skips the remaining steps.
    Pause,
}

impl Step {
    pub fn reply(msg_type: impl Into<String>, content: Value) -> Self {
        Self::Reply {
            msg_type: msg_type.into(),
            content,
        }
    }

    pub fn stdout(text: &str) -> Self {
        Self::reply("stream", json!({"name": "stdout", "text": text}))
    }

    pub fn stderr(text: &str) -> Self {
        Self::reply("stream", json!({"name": "stderr", "text": text}))
    }

    pub fn error(ename: &str, evalue: &str, traceback: &[&str]) -> Self {
        Self::reply(
            "error",
            json!({"ename": ename, "evalue": evalue, "traceback": traceback}),
        )
    }

    pub fn display_png(base64: &str) -> Self {
        Self::reply(
            "display_data",
            json!({"data": {"image/png": base64, "text/plain": "<Figure>"}, "metadata": {}}),
        )
    }

    pub fn display_text(text: &str) -> Self {
        Self::reply(
            "display_data",
            json!({"data": {"text/plain": text}, "metadata": {}}),
        )
    }

    pub fn execute_result(text: &str) -> Self {
        Self::reply(
            "execute_result",
            json!({"data": {"text/plain": text}, "metadata": {}, "execution_count": 1}),
        )
    }
}

type Inbound = mpsc::UnboundedSender<Result<String, TransportError>>;

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    created: AtomicUsize,
    live: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    interrupts: AtomicUsize,
    requests: Mutex<Vec<String>>,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    hang_open: AtomicBool,
    inbound: Mutex<Option<Inbound>>,
    interrupted: AtomicBool,
    wake: Notify,
    sequence: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn send(&self, frame: String) {
        if let Some(tx) = lock(&self.inbound).as_ref() {
            let _ = tx.send(Ok(frame));
        }
    }

    fn reply(&self, parent: &str, msg_type: &str, content: Value) {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.send(
            json!({
                "header": {"msg_id": format!("reply-{n}"), "msg_type": msg_type},
                "parent_header": {"msg_id": parent},
                "metadata": {},
                "content": content,
                "channel": "iopub",
            })
            .to_string(),
        );
    }

    async fn execute(&self, parent: &str, code: &str) {
        let steps = lock(&self.scripts).get(code).cloned().unwrap_or_default();

        self.reply(parent, "status", json!({"execution_state": "busy"}));
        self.reply(parent, "execute_input", json!({"code": code, "execution_count": 1}));
        for step in steps {
            match step {
                Step::Reply { msg_type, content } => self.reply(parent, &msg_type, content),
                Step::Pause => {
                    self.wake.notified().await;
                    if self.interrupted.swap(false, Ordering::SeqCst) {
                        self.reply(
                            parent,
                            "error",
                            json!({
                                "ename": "KeyboardInterrupt",
                                "evalue": "",
                                "traceback": ["KeyboardInterrupt"],
                            }),
                        );
                        break;
                    }
                }
            }
        }
        self.reply(parent, "status", json!({"execution_state": "idle"}));
    }
}

/// Scripted in-process kernel server. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryKernel {
    inner: Arc<Inner>,
}

impl MemoryKernel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer executions of exactly `code` with `steps`.
    #[must_use]
    pub fn script(self, code: impl Into<String>, steps: impl IntoIterator<Item = Step>) -> Self {
        lock(&self.inner.scripts).insert(code.into(), steps.into_iter().collect());
        self
    }

    /// Both transport halves, ready for a session client.
    #[must_use]
    pub fn transports(&self) -> (Arc<dyn KernelApi>, Arc<dyn ChannelConnector>) {
        (Arc::new(self.clone()), Arc::new(self.clone()))
    }

    /// Number of kernels created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.inner.deleted).clone()
    }

    #[must_use]
    pub fn interrupts(&self) -> usize {
        self.inner.interrupts.load(Ordering::SeqCst)
    }

    /// Code of every execute request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        lock(&self.inner.requests).clone()
    }

    /// Reject kernel creation with 403.
    pub fn fail_create(&self) {
        self.inner.fail_create.store(true, Ordering::SeqCst);
    }

    /// Answer deletes with a server error.
    pub fn fail_delete(&self) {
        self.inner.fail_delete.store(true, Ordering::SeqCst);
    }

    /// Never finish opening channels.
    pub fn hang_open(&self) {
        self.inner.hang_open.store(true, Ordering::SeqCst);
    }

    /// Let a paused execution continue.
    pub fn release(&self) {
        self.inner.wake.notify_one();
    }

    /// Push a raw frame onto the open channel.
    pub fn inject(&self, frame: String) {
        self.inner.send(frame);
    }

    /// Push an iopub message parented to an arbitrary request id.
    pub fn inject_reply(&self, parent: &str, step: Step) {
        if let Step::Reply { msg_type, content } = step {
            self.inner.reply(parent, &msg_type, content);
        }
    }

    /// Push a status message parented to an arbitrary request id.
    pub fn inject_status(&self, parent: &str, execution_state: &str) {
        self.inner
            .reply(parent, "status", json!({"execution_state": execution_state}));
    }

    /// Close the open channel from the server side.
    pub fn drop_connection(&self) {
        lock(&self.inner.inbound).take();
    }

    /// Fail the open channel with a transport error.
    pub fn fail_connection(&self) {
        if let Some(tx) = lock(&self.inner.inbound).take() {
            let _ = tx.send(Err(TransportError::WebSocket(
                "connection reset".to_string(),
            )));
        }
    }
}

#[async_trait]
impl KernelApi for MemoryKernel {
    async fn create_kernel(&self) -> Result<KernelInfo, TransportError> {
        if self.inner.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                status: 403,
                body: "Forbidden".to_string(),
            });
        }
        let n = self.inner.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("kernel-{n}");
        lock(&self.inner.live).push(id.clone());
        Ok(KernelInfo {
            id,
            name: Some("python3".to_string()),
            execution_state: Some("starting".to_string()),
            connections: Some(0),
            last_activity: None,
        })
    }

    async fn list_kernels(&self) -> Result<Vec<KernelInfo>, TransportError> {
        Ok(lock(&self.inner.live)
            .iter()
            .map(|id| KernelInfo {
                id: id.clone(),
                name: Some("python3".to_string()),
                execution_state: Some("idle".to_string()),
                connections: Some(1),
                last_activity: None,
            })
            .collect())
    }

    async fn delete_kernel(&self, kernel_id: &str) -> Result<(), TransportError> {
        if self.inner.fail_delete.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                status: 500,
                body: "Internal Server Error".to_string(),
            });
        }
        lock(&self.inner.live).retain(|id| id != kernel_id);
        lock(&self.inner.deleted).push(kernel_id.to_string());
        Ok(())
    }

    async fn interrupt_kernel(&self, _kernel_id: &str) -> Result<(), TransportError> {
        self.inner.interrupts.fetch_add(1, Ordering::SeqCst);
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        Ok(())
    }
}

#[async_trait]
impl ChannelConnector for MemoryKernel {
    async fn open(
        &self,
        _kernel_id: &str,
        _session_id: &str,
    ) -> Result<KernelChannel, TransportError> {
        if self.inner.hang_open.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        *lock(&self.inner.inbound) = Some(in_tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let Ok(request) = Envelope::parse(&frame) else {
                    tracing::warn!("Memory kernel received a malformed frame");
                    continue;
                };
                let code = request.content["code"].as_str().unwrap_or_default().to_string();
                lock(&inner.requests).push(code.clone());
                inner.execute(request.msg_id(), &code).await;
            }
        });

        let inbound = futures::stream::poll_fn(move |cx| in_rx.poll_recv(cx));
        Ok(KernelChannel::new(out_tx, inbound))
    }
}
