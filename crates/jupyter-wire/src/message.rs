//! The message envelope carried on a kernel WebSocket.

use bytes::Bytes;
use jupyter_protocol::{ExecutionState, Header, JupyterMessage, JupyterMessageContent};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::channel::Channel;

/// Error type for decoding and encoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Failed to parse message content: {0}")]
    Content(#[from] anyhow::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message {msg_id} ({msg_type}) has no channel")]
    MissingChannel { msg_id: String, msg_type: String },

    #[error("Malformed binary frame: {0}")]
    Frame(String),
}

/// Intermediate struct for deserializing inbound messages.
///
/// - `content` is kept as raw JSON until `header.msg_type` is known
/// - `parent_header` may be `{}`, `null`, missing, or a full header
/// - `buffers` never appear in JSON text frames; binary frames carry them
#[derive(Debug, Clone, Deserialize)]
pub struct RawWireMessage {
    pub header: Header,

    #[serde(
        default,
        deserialize_with = "jupyter_protocol::deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default)]
    pub metadata: Value,

    #[serde(default)]
    pub content: Value,

    #[serde(default)]
    pub channel: Option<Channel>,
}

impl TryFrom<RawWireMessage> for WireMessage {
    type Error = WireError;

    fn try_from(raw: RawWireMessage) -> Result<Self, Self::Error> {
        let channel = raw.channel.ok_or_else(|| WireError::MissingChannel {
            msg_id: raw.header.msg_id.clone(),
            msg_type: raw.header.msg_type.clone(),
        })?;
        let content =
            JupyterMessageContent::from_type_and_content(&raw.header.msg_type, raw.content)?;

        Ok(WireMessage {
            header: raw.header,
            parent_header: raw.parent_header,
            metadata: normalize_metadata(raw.metadata),
            content,
            buffers: Vec::new(),
            channel,
        })
    }
}

/// A Jupyter message bound to one channel of a kernel WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub header: Header,

    #[serde(serialize_with = "serialize_parent_header")]
    pub parent_header: Option<Header>,

    pub metadata: Value,

    pub content: JupyterMessageContent,

    /// Binary buffers. Sent through the binary framing, never inside JSON.
    #[serde(skip)]
    pub buffers: Vec<Bytes>,

    pub channel: Channel,
}

impl WireMessage {
    /// Wrap a message built by `jupyter_protocol` for sending on `channel`.
    pub fn from_jupyter(message: JupyterMessage, channel: Channel) -> Self {
        WireMessage {
            header: message.header,
            parent_header: message.parent_header,
            metadata: normalize_metadata(message.metadata),
            content: message.content,
            buffers: message.buffers,
            channel,
        }
    }

    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        let raw: RawWireMessage = serde_json::from_str(text)?;
        raw.try_into()
    }

    /// Parse the JSON part of a frame that was received as bytes.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, WireError> {
        let raw: RawWireMessage = serde_json::from_slice(bytes)?;
        raw.try_into()
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The id of the message this one replies to or was caused by.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header
            .as_ref()
            .map(|parent| parent.msg_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Execution state carried by an iopub `status` message.
    pub fn execution_state(&self) -> Option<&ExecutionState> {
        match &self.content {
            JupyterMessageContent::Status(status) => Some(&status.execution_state),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.header.msg_type.ends_with("_reply")
    }
}

/// Custom Deserialize implementation that goes through [`RawWireMessage`].
impl<'de> Deserialize<'de> for WireMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawWireMessage::deserialize(deserializer)?;
        raw.try_into().map_err(serde::de::Error::custom)
    }
}

// Servers and kernels expect `{}` for "no parent", not `null`.
fn serialize_parent_header<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

fn normalize_metadata(metadata: Value) -> Value {
    if metadata.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::{ExecuteRequest, KernelInfoRequest};

    fn frame(msg_type: &str, channel: &str, parent: &str, content: &str) -> String {
        format!(
            r#"{{
                "header": {{
                    "date": "2025-05-14T14:32:23.490Z",
                    "msg_id": "msg-{msg_type}",
                    "msg_type": "{msg_type}",
                    "session": "kernel-session",
                    "username": "kernel",
                    "version": "5.3"
                }},
                "parent_header": {parent},
                "metadata": {{}},
                "content": {content},
                "channel": "{channel}"
            }}"#
        )
    }

    #[test]
    fn test_deserialize_empty_parent_header() {
        let text = frame("status", "iopub", "{}", r#"{"execution_state": "busy"}"#);
        let msg = WireMessage::from_json(&text).unwrap();
        assert!(msg.parent_header.is_none());
        assert_eq!(msg.parent_msg_id(), None);
        assert_eq!(msg.channel, Channel::IoPub);
    }

    #[test]
    fn test_deserialize_null_parent_header() {
        let text = frame("status", "iopub", "null", r#"{"execution_state": "idle"}"#);
        let msg = WireMessage::from_json(&text).unwrap();
        assert!(msg.parent_header.is_none());
        assert!(matches!(msg.execution_state(), Some(ExecutionState::Idle)));
    }

    #[test]
    fn test_deserialize_stream_with_parent() {
        let parent = r#"{
            "date": "2025-05-14T14:32:23.100Z",
            "msg_id": "request-1",
            "msg_type": "execute_request",
            "session": "client-session",
            "username": "",
            "version": "5.3"
        }"#;
        let text = frame(
            "stream",
            "iopub",
            parent,
            r#"{"name": "stdout", "text": "hello\n"}"#,
        );
        let msg = WireMessage::from_json(&text).unwrap();
        assert_eq!(msg.parent_msg_id(), Some("request-1"));
        assert!(matches!(
            msg.content,
            JupyterMessageContent::StreamContent(_)
        ));
        assert!(msg.execution_state().is_none());
    }

    #[test]
    fn test_deserialize_execute_reply() {
        let text = frame(
            "execute_reply",
            "shell",
            "{}",
            r#"{"status": "ok", "execution_count": 3, "payload": [], "user_expressions": {}}"#,
        );
        let msg = WireMessage::from_json(&text).unwrap();
        assert!(msg.is_reply());
        match msg.content {
            JupyterMessageContent::ExecuteReply(reply) => {
                assert_eq!(reply.execution_count.0, 3);
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_missing_channel_is_an_error() {
        let text = r#"{
            "header": {
                "date": "2025-05-14T14:32:23.490Z",
                "msg_id": "no-channel",
                "msg_type": "status",
                "session": "s",
                "username": "",
                "version": "5.3"
            },
            "parent_header": {},
            "metadata": {},
            "content": {"execution_state": "idle"}
        }"#;
        let err = WireMessage::from_json(text).unwrap_err();
        assert!(matches!(err, WireError::MissingChannel { ref msg_id, .. } if msg_id == "no-channel"));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let err = WireMessage::from_json("{not json").unwrap_err();
        assert!(matches!(err, WireError::Json(_)));
    }

    #[test]
    fn test_outbound_request_serializes_flat() {
        let message: JupyterMessage = ExecuteRequest::new("1 + 1".to_string()).into();
        let wire = WireMessage::from_jupyter(message, Channel::Shell);
        let value: Value = serde_json::from_str(&wire.to_json().unwrap()).unwrap();

        assert_eq!(value["header"]["msg_type"], "execute_request");
        assert_eq!(value["content"]["code"], "1 + 1");
        assert_eq!(value["channel"], "shell");
        assert_eq!(value["parent_header"], serde_json::json!({}));
        assert!(value["metadata"].is_object());
        assert!(value.get("buffers").is_none());
    }

    #[test]
    fn test_outbound_request_parses_back() {
        let message: JupyterMessage = KernelInfoRequest::default().into();
        let wire = WireMessage::from_jupyter(message, Channel::Shell);
        let parsed = WireMessage::from_json(&wire.to_json().unwrap()).unwrap();
        assert_eq!(parsed.msg_id(), wire.msg_id());
        assert_eq!(parsed.msg_type(), "kernel_info_request");
    }
}
