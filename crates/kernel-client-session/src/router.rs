//! The single reader of a session's kernel channel.
//!
//! Every inbound frame goes through [`route_frame`]: parse, correlate with
//! the outstanding request, classify, then publish or advance the tracker.
//! Subscribers are always called with the state lock released.

use std::sync::{Mutex, PoisonError};

use futures::{StreamExt, stream::BoxStream};
use kernel_client_core::{
    Classified, Envelope, ExecutionTracker, ImageArena, OutputBus, OutputItem, ProtocolError,
    SessionError, SessionStatus, TransportError, classify,
    tracker::StatusTransition,
};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::client::ExecutionOutcome;

pub(crate) type Completion = oneshot::Sender<Result<ExecutionOutcome, SessionError>>;

/// Mutable session state guarded by one lock.
pub(crate) struct State {
    pub(crate) tracker: ExecutionTracker,
    pub(crate) completion: Option<Completion>,
    pub(crate) images: ImageArena,
    pub(crate) failure: Option<String>,
}

/// State shared between a [`SessionClient`](crate::SessionClient) and its router.
pub(crate) struct Shared {
    state: Mutex<State>,
    status: watch::Sender<SessionStatus>,
    /// Bumped on every transition into `Idle`; never merged away.
    idled: watch::Sender<u64>,
    pub(crate) bus: OutputBus,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(SessionStatus::Uninitiated);
        let (idled, _) = watch::channel(0);
        Self {
            state: Mutex::new(State {
                tracker: ExecutionTracker::new(),
                completion: None,
                images: ImageArena::new(),
                failure: None,
            }),
            status,
            idled,
            bus: OutputBus::new(),
        }
    }

    /// Run `f` under the state lock, then publish the tracker's status.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut state);
        let next = state.tracker.status();
        let mut became_idle = false;
        self.status.send_if_modified(|current| {
            let changed = *current != next;
            became_idle = changed && next == SessionStatus::Idle;
            *current = next;
            changed
        });
        if became_idle {
            self.idled.send_modify(|n| *n += 1);
        }
        result
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub(crate) fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Resolve once the session next becomes idle, or at once if it is.
    ///
    /// Keyed on idle transitions rather than the latest status, so a new
    /// request started right after completion does not hide the idle.
    pub(crate) async fn wait_idle(&self) -> Result<(), SessionError> {
        let mut idled = self.idled.subscribe();
        let mut status = self.status.subscribe();
        let seen = *idled.borrow_and_update();
        let current = *status.borrow_and_update();
        match current {
            SessionStatus::Uninitiated => return Err(SessionError::NotReady),
            SessionStatus::Idle => return Ok(()),
            SessionStatus::ShuttingDown | SessionStatus::Terminated => {
                return Err(self.termination_error());
            }
            SessionStatus::Starting | SessionStatus::Busy => {}
        }

        let became_idle = tokio::select! {
            biased;
            idle = idled.wait_for(|n| *n > seen) => idle.is_ok(),
            _ = status.wait_for(|s| s.is_terminal()) => false,
        };
        if became_idle {
            Ok(())
        } else {
            Err(self.termination_error())
        }
    }

    /// The error reported to callers once the session is gone.
    pub(crate) fn termination_error(&self) -> SessionError {
        self.read(|s| s.failure.clone())
            .map_or(SessionError::Terminated, SessionError::ConnectionLost)
    }

    /// Terminate after the channel failed underneath us.
    ///
    /// A no-op once shutdown has begun: the channel closing is then expected.
    pub(crate) fn fail(&self, err: SessionError) {
        let completion = self.update(|s| {
            if s.tracker.status().is_terminal() {
                return None;
            }
            tracing::error!("Kernel session failed: {err}");
            s.failure = Some(match &err {
                SessionError::ConnectionLost(reason) => reason.clone(),
                other => other.to_string(),
            });
            s.tracker.terminate();
            Some(s.completion.take())
        });

        let Some(completion) = completion else {
            return;
        };
        self.bus.close();
        if let Some(tx) = completion {
            let _ = tx.send(Err(err));
        }
    }
}

enum Routed {
    Publish(OutputItem),
    Complete(ExecutionOutcome, Option<Completion>),
    Nothing,
}

/// Read `inbound` until it ends, fails, or `stop` fires.
pub(crate) async fn run(
    shared: std::sync::Arc<Shared>,
    mut inbound: BoxStream<'static, Result<String, TransportError>>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = stop.cancelled() => {
                tracing::debug!("Router stopped");
                return;
            }
            frame = inbound.next() => frame,
        };

        match frame {
            Some(Ok(text)) => {
                if let Err(e) = route_frame(&shared, &text) {
                    shared.fail(SessionError::Protocol(e));
                    return;
                }
            }
            Some(Err(e)) => {
                shared.fail(SessionError::ConnectionLost(e.to_string()));
                return;
            }
            None => {
                shared.fail(SessionError::ConnectionLost(
                    "channel closed by server".to_string(),
                ));
                return;
            }
        }
    }
}

/// Handle one inbound frame. Only envelope-level violations are errors.
pub(crate) fn route_frame(shared: &Shared, frame: &str) -> Result<(), ProtocolError> {
    let msg = Envelope::parse(frame)?;
    if !msg.is_iopub() {
        tracing::trace!(
            msg_type = %msg.header.msg_type,
            channel = msg.channel.as_deref().unwrap_or_default(),
            "Ignoring non-iopub message"
        );
        return Ok(());
    }

    match shared.update(|s| route(s, &msg)) {
        Routed::Publish(item) => shared.bus.publish(&item),
        Routed::Complete(outcome, completion) => {
            tracing::debug!(
                request_id = %outcome.request_id,
                errored = outcome.errored,
                elapsed = ?outcome.elapsed,
                "Execution finished"
            );
            if let Some(tx) = completion {
                let _ = tx.send(Ok(outcome));
            }
        }
        Routed::Nothing => {}
    }
    Ok(())
}

fn route(state: &mut State, msg: &Envelope) -> Routed {
    let parent = msg.parent_msg_id();
    let Some(request_id) = state
        .tracker
        .outstanding()
        .filter(|_| state.tracker.correlates(parent))
        .map(|req| req.msg_id.clone())
    else {
        match parent {
            Some(p) if state.tracker.is_abandoned(p) => {
                tracing::debug!(
                    parent = p,
                    msg_type = %msg.header.msg_type,
                    "Discarding message for abandoned request"
                );
            }
            _ => {
                tracing::debug!(
                    parent = ?parent,
                    msg_type = %msg.header.msg_type,
                    "Discarding stale message"
                );
            }
        }
        return Routed::Nothing;
    };

    match classify(msg, &mut state.images, &request_id) {
        Ok(Classified::Item(item)) => {
            if item.is_error() {
                state.tracker.note_error();
            }
            Routed::Publish(item)
        }
        Ok(Classified::Status(execution_state)) => {
            match state.tracker.observe_status(parent, execution_state) {
                StatusTransition::Completed(request) => Routed::Complete(
                    ExecutionOutcome {
                        elapsed: request.elapsed(),
                        errored: request.errored,
                        request_id: request.msg_id,
                    },
                    state.completion.take(),
                ),
                StatusTransition::Stale | StatusTransition::Unchanged => Routed::Nothing,
            }
        }
        Ok(Classified::Ignored) => Routed::Nothing,
        Err(e) => {
            tracing::warn!("Dropping {} message: {e}", msg.header.msg_type);
            Routed::Nothing
        }
    }
}
