//! Typed output items and the classifier that produces them.

use serde::{Deserialize, Serialize};

use crate::{
    error::ProtocolError,
    images::{ImageArena, ImageFormat, ImageKey},
    wire::{
        DisplayContent, Envelope, ErrorContent, ExecutionState, MessageKind, StatusContent,
        StreamContent,
    },
};

/// Which standard stream a `stream` item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// Message type that carried a rich display bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayOrigin {
    DisplayData,
    ExecuteResult,
}

/// One piece of program output, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    /// Text written to stdout or stderr.
    Stream { name: StreamName, text: String },
    /// An image whose payload lives in the session's [`ImageArena`].
    DisplayImage {
        format: ImageFormat,
        key: ImageKey,
        origin: DisplayOrigin,
    },
    /// Plain-text fallback of a `display_data` bundle.
    Text { text: String },
    /// Plain-text rendering of an evaluated expression.
    ExecuteResult { text: String },
    /// An exception raised by the user's code. Traceback lines keep their
    /// terminal escape sequences.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl OutputItem {
    /// Traceback lines joined with newlines, or `None` for non-error items.
    #[must_use]
    pub fn error_text(&self) -> Option<String> {
        match self {
            Self::Error { traceback, .. } => Some(traceback.join("\n")),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Plain-text rendering for text-only consumers.
    ///
    /// Stderr is prefixed with `Error: ` and images become an `<img>`
    /// placeholder naming their key.
    #[must_use]
    pub fn render_text(&self) -> String {
        match self {
            Self::Stream {
                name: StreamName::Stdout,
                text,
            } => text.clone(),
            Self::Stream {
                name: StreamName::Stderr,
                text,
            } => format!("Error: {text}"),
            Self::DisplayImage { format, key, .. } => {
                format!("Image: <img src=\"{key}.{}\" />", format.extension())
            }
            Self::Text { text } | Self::ExecuteResult { text } => text.clone(),
            Self::Error { traceback, .. } => traceback.join("\n"),
        }
    }
}

/// What one inbound message means to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Item(OutputItem),
    Status(ExecutionState),
    Ignored,
}

/// Classify a message already correlated to `request_id`.
///
/// Images are stored in `images` under the request's partition.
///
/// # Errors
/// Returns error if the content does not match what its message type promises.
pub fn classify(
    msg: &Envelope,
    images: &mut ImageArena,
    request_id: &str,
) -> Result<Classified, ProtocolError> {
    let classified = match msg.kind() {
        MessageKind::Stream => {
            let content: StreamContent = msg.content_as()?;
            match StreamName::parse(&content.name) {
                Some(name) => Classified::Item(OutputItem::Stream {
                    name,
                    text: content.text,
                }),
                None => {
                    tracing::debug!(stream = %content.name, "Ignoring unknown stream");
                    Classified::Ignored
                }
            }
        }
        MessageKind::DisplayData => {
            classify_display(msg, images, request_id, DisplayOrigin::DisplayData)?
        }
        MessageKind::ExecuteResult => {
            classify_display(msg, images, request_id, DisplayOrigin::ExecuteResult)?
        }
        MessageKind::Error => {
            let content: ErrorContent = msg.content_as()?;
            Classified::Item(OutputItem::Error {
                ename: content.ename,
                evalue: content.evalue,
                traceback: content.traceback,
            })
        }
        MessageKind::Status => {
            let content: StatusContent = msg.content_as()?;
            Classified::Status(content.execution_state)
        }
        MessageKind::ExecuteInput | MessageKind::ExecuteReply | MessageKind::Other(_) => {
            Classified::Ignored
        }
    };
    Ok(classified)
}

fn classify_display(
    msg: &Envelope,
    images: &mut ImageArena,
    request_id: &str,
    origin: DisplayOrigin,
) -> Result<Classified, ProtocolError> {
    let content: DisplayContent = msg.content_as()?;

    if let Some(payload) = content.text(ImageFormat::Png.mime()) {
        let key = images.insert(request_id, ImageFormat::Png, &payload);
        return Ok(Classified::Item(OutputItem::DisplayImage {
            format: ImageFormat::Png,
            key,
            origin,
        }));
    }

    Ok(match content.text("text/plain") {
        Some(text) => Classified::Item(match origin {
            DisplayOrigin::DisplayData => OutputItem::Text { text },
            DisplayOrigin::ExecuteResult => OutputItem::ExecuteResult { text },
        }),
        None => Classified::Ignored,
    })
}
