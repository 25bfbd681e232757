//! Error types for transports and sessions.

use thiserror::Error;

/// Failure talking to the server, over HTTP or the channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Channel closed")]
    Closed,
}

/// An inbound message that does not have the shape its type promises.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("Envelope is missing {0}")]
    MissingField(&'static str),
    #[error("Unexpected content for {msg_type}: {reason}")]
    Content { msg_type: String, reason: String },
}

/// Errors surfaced by a session client.
///
/// Exceptions raised by user code are not errors; they arrive as
/// [`OutputItem::Error`](crate::OutputItem::Error).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("An execution is already in progress")]
    Busy,
    #[error("Session is not ready")]
    NotReady,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Session terminated")]
    Terminated,
    #[error("Connection to the kernel was lost: {0}")]
    ConnectionLost(String),
    #[error("Execution was abandoned by shutdown")]
    Abandoned,
}

impl SessionError {
    /// Whether the session that produced this error can no longer be used.
    ///
    /// `Busy` and `NotReady` only reject one call; everything else means
    /// the session is gone (or never came up).
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::Busy | Self::NotReady)
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(d) => Self::Timeout(format!("no response within {d:?}")),
            other => Self::Connection(other.to_string()),
        }
    }
}
