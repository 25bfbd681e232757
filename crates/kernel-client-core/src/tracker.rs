//! Execution state machine for one kernel session.

use std::{collections::VecDeque, fmt, time::Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::SessionError,
    wire::{ExecutionState, MsgId},
};

/// How many abandoned request ids are remembered for stale-message logging.
const ABANDONED_HISTORY: usize = 16;

/// Lifecycle status of a kernel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitiated,
    Starting,
    Idle,
    Busy,
    ShuttingDown,
    Terminated,
}

impl SessionStatus {
    /// Whether the machine may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionStatus::{Busy, Idle, ShuttingDown, Starting, Terminated, Uninitiated};
        matches!(
            (self, next),
            (Uninitiated, Starting)
                | (Starting, Idle)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Uninitiated | Starting | Idle | Busy, ShuttingDown | Terminated)
                | (ShuttingDown, Terminated)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitiated => "uninitiated",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// One submitted piece of code.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Message id of the execute request; responses carry it as parent id.
    pub msg_id: MsgId,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub completed: bool,
    /// Whether the kernel reported an exception for this request.
    pub errored: bool,
    started: Instant,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new(msg_id: impl Into<MsgId>, code: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            code: code.into(),
            created_at: Utc::now(),
            completed: false,
            errored: false,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

/// Effect of a `status` message on the tracker.
#[derive(Debug)]
pub enum StatusTransition {
    /// The message answers nothing outstanding and was dropped.
    Stale,
    /// Correlated, but no state change (e.g. `busy`).
    Unchanged,
    /// The outstanding request finished; the session is idle again.
    Completed(ExecutionRequest),
}

/// Result of asking the tracker to shut down.
#[derive(Debug)]
pub enum ShutdownStep {
    /// Shutdown already started earlier.
    AlreadyTerminating,
    /// First shutdown call; `abandoned` is the request that was in flight.
    Proceed {
        abandoned: Option<ExecutionRequest>,
    },
}

/// The state machine itself. Holds at most one outstanding request.
#[derive(Debug)]
pub struct ExecutionTracker {
    status: SessionStatus,
    outstanding: Option<ExecutionRequest>,
    abandoned: VecDeque<MsgId>,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: SessionStatus::Uninitiated,
            outstanding: None,
            abandoned: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub const fn outstanding(&self) -> Option<&ExecutionRequest> {
        self.outstanding.as_ref()
    }

    fn set(&mut self, next: SessionStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.status
        );
        self.status = next;
    }

    /// `Uninitiated -> Starting`. Returns `Ok(false)` if the session was
    /// already started.
    ///
    /// # Errors
    /// Returns `Terminated` after shutdown.
    pub fn begin_start(&mut self) -> Result<bool, SessionError> {
        match self.status {
            SessionStatus::Uninitiated => {
                self.set(SessionStatus::Starting);
                Ok(true)
            }
            SessionStatus::Starting | SessionStatus::Idle | SessionStatus::Busy => Ok(false),
            SessionStatus::ShuttingDown | SessionStatus::Terminated => {
                Err(SessionError::Terminated)
            }
        }
    }

    /// `Starting -> Idle`, once the channel is open.
    ///
    /// # Errors
    /// Returns `Terminated` if shutdown won the race.
    pub fn mark_ready(&mut self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Starting => {
                self.set(SessionStatus::Idle);
                Ok(())
            }
            SessionStatus::Idle | SessionStatus::Busy => Ok(()),
            SessionStatus::Uninitiated => Err(SessionError::NotReady),
            SessionStatus::ShuttingDown | SessionStatus::Terminated => {
                Err(SessionError::Terminated)
            }
        }
    }

    /// `Idle -> Busy` with `request` outstanding.
    ///
    /// # Errors
    /// `Busy` while another request is outstanding, `NotReady` before the
    /// session is up, `Terminated` after shutdown. The tracker is unchanged
    /// on error.
    pub fn begin_execution(&mut self, request: ExecutionRequest) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Idle => {
                self.outstanding = Some(request);
                self.set(SessionStatus::Busy);
                Ok(())
            }
            SessionStatus::Busy => Err(SessionError::Busy),
            SessionStatus::Uninitiated | SessionStatus::Starting => Err(SessionError::NotReady),
            SessionStatus::ShuttingDown | SessionStatus::Terminated => {
                Err(SessionError::Terminated)
            }
        }
    }

    /// Whether `parent_id` names the outstanding request.
    #[must_use]
    pub fn correlates(&self, parent_id: Option<&str>) -> bool {
        match (parent_id, &self.outstanding) {
            (Some(parent), Some(req)) => req.msg_id == parent,
            _ => false,
        }
    }

    /// Whether `parent_id` names a request dropped by shutdown.
    #[must_use]
    pub fn is_abandoned(&self, parent_id: &str) -> bool {
        self.abandoned.iter().any(|id| id == parent_id)
    }

    /// Record that the outstanding request raised an exception.
    pub fn note_error(&mut self) {
        if let Some(req) = self.outstanding.as_mut() {
            req.errored = true;
        }
    }

    /// Apply a `status` message.
    pub fn observe_status(
        &mut self,
        parent_id: Option<&str>,
        state: ExecutionState,
    ) -> StatusTransition {
        if self.status != SessionStatus::Busy || !self.correlates(parent_id) {
            return StatusTransition::Stale;
        }

        match state {
            ExecutionState::Idle => match self.outstanding.take() {
                Some(mut request) => {
                    self.set(SessionStatus::Idle);
                    request.completed = true;
                    StatusTransition::Completed(request)
                }
                None => StatusTransition::Stale,
            },
            ExecutionState::Busy | ExecutionState::Starting | ExecutionState::Other => {
                StatusTransition::Unchanged
            }
        }
    }

    /// `* -> ShuttingDown`. The outstanding request, if any, is abandoned.
    pub fn begin_shutdown(&mut self) -> ShutdownStep {
        if self.status.is_terminal() {
            return ShutdownStep::AlreadyTerminating;
        }
        self.set(SessionStatus::ShuttingDown);
        ShutdownStep::Proceed {
            abandoned: self.abandon_outstanding(),
        }
    }

    /// Move to `Terminated`, abandoning anything outstanding.
    pub fn terminate(&mut self) -> Option<ExecutionRequest> {
        if self.status != SessionStatus::Terminated {
            self.set(SessionStatus::Terminated);
        }
        self.abandon_outstanding()
    }

    fn abandon_outstanding(&mut self) -> Option<ExecutionRequest> {
        let request = self.outstanding.take()?;
        if self.abandoned.len() == ABANDONED_HISTORY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(request.msg_id.clone());
        Some(request)
    }
}
