//! Wire protocols: streaming events, chat socket frames and call signaling.

use agent_link_core::{
    ContentFragment, Fragment, IceCandidate, SessionDescription, message::SourceLink,
    traits::ServerSentEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame that could not be interpreted.
///
/// Controllers log these and keep the channel open.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown frame type: {0}")]
    UnknownType(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Streamed assistant content as sent by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceLink>>,
}

impl From<ContentPayload> for Fragment {
    fn from(payload: ContentPayload) -> Self {
        Self::Content(ContentFragment {
            text: payload.message,
            stream_id: payload.stream_id,
            done: payload.done == Some(true),
            sources: payload.sources,
        })
    }
}

/// Extract a human-readable error from an `{error}` payload.
#[must_use]
pub fn error_text(value: &Value) -> Option<String> {
    match value.get("error")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        ),
        Value::Null | Value::Bool(false) => None,
        other => Some(other.to_string()),
    }
}

fn content_or_error(body: &Value) -> Result<Fragment, ProtocolError> {
    if let Some(reason) = error_text(body) {
        return Ok(Fragment::Error { reason });
    }
    let payload: ContentPayload = serde_json::from_value(body.clone())?;
    Ok(payload.into())
}

fn str_field(body: &Value, key: &str) -> Option<String> {
    body.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Event on the streaming send endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The backend assigned or confirmed the session.
    Connected {
        session_id: Option<String>,
        request_id: Option<String>,
    },
    /// The backend wants the conversation moved to the socket.
    UpgradeToWebsocket { request_id: Option<String> },
    /// Content or a backend error, ready for the reassembler.
    Fragment(Fragment),
}

impl StreamEvent {
    /// Decode a server-sent event.
    ///
    /// The discriminant is taken from the SSE event name, else from an
    /// `event` field, else from a `status` field. Events without one are
    /// content.
    ///
    /// # Errors
    /// Returns error for non-JSON data or an unknown discriminant.
    pub fn decode(raw: &ServerSentEvent) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(&raw.data)?;
        let discriminant = raw
            .event
            .clone()
            .filter(|name| name != "message")
            .or_else(|| str_field(&value, "event"))
            .or_else(|| str_field(&value, "status"));
        let body = value
            .get("data")
            .filter(|data| data.is_object())
            .unwrap_or(&value);

        match discriminant.as_deref() {
            Some("connected") => Ok(Self::Connected {
                session_id: str_field(body, "sessionId"),
                request_id: str_field(body, "requestId"),
            }),
            Some("upgrade_to_websocket" | "upgradeToWebsocket") => Ok(Self::UpgradeToWebsocket {
                request_id: str_field(body, "requestId"),
            }),
            Some("error") => Ok(Self::Fragment(Fragment::Error {
                reason: error_text(body)
                    .or_else(|| str_field(body, "message"))
                    .unwrap_or_else(|| "unspecified error".to_string()),
            })),
            None | Some("content" | "message" | "delta") => content_or_error(body).map(Self::Fragment),
            Some(other) if body.get("message").is_some() || body.get("done").is_some() => {
                tracing::debug!(status = other, "treating status event as content");
                content_or_error(body).map(Self::Fragment)
            }
            Some(other) => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Frame types on the chat socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatFrameType {
    Ping,
    Pong,
    Message,
    Typing,
    TypingOff,
    End,
}

/// A chat socket frame: `{type, eventId?, data}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(rename = "type")]
    pub kind: ChatFrameType,
    #[serde(rename = "eventId", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ChatFrame {
    fn new(kind: ChatFrameType, event_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            event_id: Some(event_id.into()),
            data,
        }
    }

    #[must_use]
    pub fn ping(event_id: impl Into<String>) -> Self {
        Self::new(ChatFrameType::Ping, event_id, Value::Null)
    }

    #[must_use]
    pub fn pong(event_id: impl Into<String>) -> Self {
        Self::new(ChatFrameType::Pong, event_id, Value::Null)
    }

    /// A user message.
    #[must_use]
    pub fn message(event_id: impl Into<String>, text: &str, html: Option<&str>) -> Self {
        Self::new(
            ChatFrameType::Message,
            event_id,
            serde_json::json!({ "message": text, "html": html }),
        )
    }

    #[must_use]
    pub fn end(event_id: impl Into<String>) -> Self {
        Self::new(ChatFrameType::End, event_id, Value::Null)
    }

    /// Serialize for the socket.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Interpreted inbound chat socket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundChatFrame {
    Ping { event_id: Option<String> },
    Pong { event_id: Option<String> },
    Message {
        event_id: Option<String>,
        fragment: Fragment,
    },
    Typing { event_id: Option<String> },
    TypingOff { event_id: Option<String> },
    End { event_id: Option<String> },
}

impl InboundChatFrame {
    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns error for malformed JSON or an unknown `type`.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let frame: ChatFrame = serde_json::from_value(value.clone()).map_err(|e| {
            match value.get("type").and_then(Value::as_str) {
                Some(kind) if serde_json::from_value::<ChatFrameType>(Value::from(kind)).is_err() => {
                    ProtocolError::UnknownType(kind.to_string())
                }
                _ => ProtocolError::from(e),
            }
        })?;

        let event_id = frame.event_id;
        Ok(match frame.kind {
            ChatFrameType::Ping => Self::Ping { event_id },
            ChatFrameType::Pong => Self::Pong { event_id },
            ChatFrameType::Message => Self::Message {
                event_id,
                fragment: content_or_error(&frame.data)?,
            },
            ChatFrameType::Typing => Self::Typing { event_id },
            ChatFrameType::TypingOff => Self::TypingOff { event_id },
            ChatFrameType::End => Self::End { event_id },
        })
    }

    /// Correlation id carried by the frame.
    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::Ping { event_id }
            | Self::Pong { event_id }
            | Self::Message { event_id, .. }
            | Self::Typing { event_id }
            | Self::TypingOff { event_id }
            | Self::End { event_id } => event_id.as_deref(),
        }
    }
}

/// SDP payload of offer/answer frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

impl From<&SessionDescription> for SdpPayload {
    fn from(description: &SessionDescription) -> Self {
        Self {
            sdp: description.sdp.clone(),
        }
    }
}

/// Call signaling frame: `{type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum SignalingMessage {
    Ping,
    Pong,
    Offer(SdpPayload),
    Answer(SdpPayload),
    Ice(IceCandidate),
    RenegotiationOffer(SdpPayload),
    RenegotiationAnswer(SdpPayload),
    End,
    Error(Value),
}

const SIGNALING_TYPES: &[&str] = &[
    "ping",
    "pong",
    "offer",
    "answer",
    "ice",
    "renegotiationOffer",
    "renegotiationAnswer",
    "end",
    "error",
];

impl SignalingMessage {
    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns error for malformed JSON or an unknown `type`.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| {
            let kind = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| str_field(&v, "type"));
            match kind {
                Some(kind) if !SIGNALING_TYPES.contains(&kind.as_str()) => {
                    ProtocolError::UnknownType(kind)
                }
                _ => ProtocolError::from(e),
            }
        })
    }

    /// Serialize for the socket.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Human-readable text of an `error` frame.
    #[must_use]
    pub fn error_message(payload: &Value) -> String {
        match payload {
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| other.to_string(), str::to_string),
        }
    }
}
