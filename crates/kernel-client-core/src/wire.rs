//! Kernel wire protocol envelopes carried over the channels socket.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Message identifier, unique per message.
pub type MsgId = String;

/// Protocol version stamped on outbound headers.
pub const PROTOCOL_VERSION: &str = "5.3";

const USERNAME: &str = "kernel-client";

/// Message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: MsgId,
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default)]
    pub version: String,
}

impl Header {
    /// Create a header with a fresh message id.
    #[must_use]
    pub fn new(msg_type: &str, session_id: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            session: session_id.to_string(),
            username: USERNAME.to_string(),
            date: Some(chrono::Utc::now().to_rfc3339()),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// The part of a parent header needed for correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentHeader {
    pub msg_id: MsgId,
}

/// A full message as it travels over the channels socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    /// Kernels send `{}` for messages that answer nothing.
    #[serde(
        default,
        serialize_with = "parent::serialize",
        deserialize_with = "parent::deserialize"
    )]
    pub parent_header: Option<ParentHeader>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub buffers: Vec<Value>,
}

impl Envelope {
    /// Build an `execute_request` for the shell channel.
    #[must_use]
    pub fn execute_request(session_id: &str, code: &str) -> Self {
        Self {
            header: Header::new("execute_request", session_id),
            parent_header: None,
            metadata: json!({}),
            content: json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
            channel: Some("shell".to_string()),
            buffers: Vec::new(),
        }
    }

    /// Parse one text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not JSON or lacks a usable header.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_str(frame)?;
        if envelope.header.msg_type.is_empty() {
            return Err(ProtocolError::MissingField("header.msg_type"));
        }
        Ok(envelope)
    }

    /// Serialize to a text frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    #[must_use]
    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_msg_type(&self.header.msg_type)
    }

    /// Id of the request this message answers, if any.
    #[must_use]
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|p| p.msg_id.as_str())
    }

    /// Whether the message came from the iopub channel. Servers that omit
    /// the channel field are treated as iopub.
    #[must_use]
    pub fn is_iopub(&self) -> bool {
        self.channel.as_deref().is_none_or(|c| c == "iopub")
    }

    /// Decode the content as `T`.
    ///
    /// # Errors
    /// Returns error if the content does not have the expected shape.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.content).map_err(|e| ProtocolError::Content {
            msg_type: self.header.msg_type.clone(),
            reason: e.to_string(),
        })
    }
}

/// Message types the router knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Stream,
    DisplayData,
    ExecuteResult,
    Error,
    Status,
    ExecuteInput,
    ExecuteReply,
    Other(String),
}

impl MessageKind {
    #[must_use]
    pub fn from_msg_type(msg_type: &str) -> Self {
        match msg_type {
            "stream" => Self::Stream,
            "display_data" => Self::DisplayData,
            "execute_result" => Self::ExecuteResult,
            "error" => Self::Error,
            "status" => Self::Status,
            "execute_input" => Self::ExecuteInput,
            "execute_reply" => Self::ExecuteReply,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Content of a `stream` message.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamContent {
    pub name: String,
    pub text: String,
}

/// Content of `display_data` and `execute_result` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct DisplayContent {
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl DisplayContent {
    /// Text stored under `mime`. Multi-line bundles may arrive as arrays of
    /// strings; those are concatenated.
    #[must_use]
    pub fn text(&self, mime: &str) -> Option<String> {
        match self.data.get(mime)? {
            Value::String(s) => Some(s.clone()),
            Value::Array(parts) => Some(parts.iter().filter_map(Value::as_str).collect()),
            _ => None,
        }
    }
}

/// Content of an `error` message.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorContent {
    #[serde(default)]
    pub ename: String,
    #[serde(default)]
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Content of a `status` message.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusContent {
    pub execution_state: ExecutionState,
}

/// Kernel execution state reported by `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
    #[serde(other)]
    Other,
}

mod parent {
    use super::{Deserialize, Deserializer, ParentHeader, Serialize, Serializer, Value, json};

    pub fn serialize<S: Serializer>(p: &Option<ParentHeader>, s: S) -> Result<S::Ok, S::Error> {
        match p {
            Some(p) => p.serialize(s),
            None => json!({}).serialize(s),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ParentHeader>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value
            .as_ref()
            .and_then(|v| v.get("msg_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(|id| ParentHeader {
                msg_id: id.to_string(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_shape() {
        let msg = Envelope::execute_request("sess-1", "print('x')");
        let frame = msg.to_frame().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["header"]["msg_type"], "execute_request");
        assert_eq!(value["header"]["session"], "sess-1");
        assert_eq!(value["channel"], "shell");
        assert_eq!(value["content"]["code"], "print('x')");
        assert_eq!(value["content"]["silent"], false);
        assert_eq!(value["parent_header"], json!({}));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Envelope::execute_request("s", "1");
        let b = Envelope::execute_request("s", "1");
        assert_ne!(a.msg_id(), b.msg_id());
    }

    #[test]
    fn test_parse_empty_parent_header() {
        let frame = r#"{"header":{"msg_id":"m1","msg_type":"status"},"parent_header":{},"content":{"execution_state":"starting"},"channel":"iopub"}"#;
        let msg = Envelope::parse(frame).unwrap();
        assert_eq!(msg.parent_msg_id(), None);
        assert_eq!(msg.kind(), MessageKind::Status);
        assert!(msg.is_iopub());
    }

    #[test]
    fn test_parse_rejects_missing_header() {
        let err = Envelope::parse(r#"{"content":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Envelope(_)));

        let err = Envelope::parse(r#"{"header":{"msg_id":"m","msg_type":""}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField(_)));

        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn test_content_shape_mismatch() {
        let frame = r#"{"header":{"msg_id":"m1","msg_type":"stream"},"parent_header":{"msg_id":"p"},"content":{"name":"stdout"}}"#;
        let msg = Envelope::parse(frame).unwrap();
        let err = msg.content_as::<StreamContent>().unwrap_err();
        assert!(matches!(err, ProtocolError::Content { ref msg_type, .. } if msg_type == "stream"));
    }

    #[test]
    fn test_unknown_execution_state() {
        let status: StatusContent =
            serde_json::from_value(json!({"execution_state": "restarting"})).unwrap();
        assert_eq!(status.execution_state, ExecutionState::Other);
    }

    #[test]
    fn test_display_text_joins_arrays() {
        let content: DisplayContent =
            serde_json::from_value(json!({"data": {"text/plain": ["a", "b"]}})).unwrap();
        assert_eq!(content.text("text/plain").as_deref(), Some("ab"));
        assert_eq!(content.text("image/png"), None);
    }
}
