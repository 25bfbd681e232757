//! Notebook cell execution.
//!
//! Cancellation has two independent capabilities on [`CancelHandle`]:
//! stop consuming output locally, and additionally ask the kernel to
//! interrupt the running code.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use kernel_client_core::{OutputItem, SessionError};
use kernel_client_session::{ExecutionOutcome, SessionClient};
use tokio_util::sync::CancellationToken;

/// Shared cancel switch for one cell run. Clones control the same run.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    interrupt: Arc<AtomicBool>,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop aggregating output. The kernel keeps running the code and the
    /// session stays busy until it finishes.
    pub fn stop_consuming(&self) {
        self.token.cancel();
    }

    /// Stop aggregating output and interrupt the kernel.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

/// How a cell run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellOutcome {
    /// The kernel finished the cell.
    Completed {
        outputs: Vec<OutputItem>,
        execution: ExecutionOutcome,
    },
    /// The caller cancelled before the kernel finished. `interrupted` is
    /// whether the kernel accepted an interrupt.
    Cancelled {
        outputs: Vec<OutputItem>,
        interrupted: bool,
    },
}

impl CellOutcome {
    /// Output gathered before the run ended.
    #[must_use]
    pub fn outputs(&self) -> &[OutputItem] {
        match self {
            Self::Completed { outputs, .. } | Self::Cancelled { outputs, .. } => outputs,
        }
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Run `code` as one cell on an initiated session.
///
/// `on_update` receives the whole aggregate after every new item. Items
/// arriving after cancellation are not aggregated.
///
/// # Errors
/// Returns the session's error if the code cannot be started or the
/// session ends before the kernel finishes.
pub async fn execute_cell<F>(
    client: &SessionClient,
    code: &str,
    cancel: &CancelHandle,
    on_update: F,
) -> Result<CellOutcome, SessionError>
where
    F: Fn(&[OutputItem]) + Send + Sync + 'static,
{
    let outputs = Arc::new(Mutex::new(Vec::new()));
    if cancel.is_cancelled() {
        return Ok(CellOutcome::Cancelled {
            outputs: Vec::new(),
            interrupted: false,
        });
    }

    // Dropped on every exit path, which unsubscribes.
    let _subscription = {
        let outputs = Arc::clone(&outputs);
        let cancel = cancel.clone();
        client.on_output_item(move |item| {
            if cancel.is_cancelled() {
                return;
            }
            let mut outputs = outputs.lock().unwrap_or_else(PoisonError::into_inner);
            outputs.push(item.clone());
            on_update(&outputs);
        })
    };

    let pending = client.run_code(code)?;
    tracing::debug!(request_id = pending.request_id(), "Cell started");

    let take = || std::mem::take(&mut *outputs.lock().unwrap_or_else(PoisonError::into_inner));
    tokio::select! {
        result = pending.finished() => {
            let execution = result?;
            Ok(CellOutcome::Completed { outputs: take(), execution })
        }
        () = cancel.token.cancelled() => {
            let interrupted = if cancel.interrupt_requested() {
                client.interrupt().await.unwrap_or(false)
            } else {
                false
            };
            tracing::info!(interrupted, "Cell cancelled");
            Ok(CellOutcome::Cancelled { outputs: take(), interrupted })
        }
    }
}
