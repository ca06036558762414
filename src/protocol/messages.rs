//! Protocol message types
//!
//! The [`Envelope`] is the unit exchanged with the broker: a topic, a type tag
//! and a body whose interpretation is fixed by the tag. Event frames, settings
//! requests and control commands are JSON documents carried inside envelopes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Type tag of a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Nothing was received
    None,
    Json,
    Blob,
    /// Protocol-level error frame from the broker
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::None => "none",
            MessageType::Json => "json",
            MessageType::Blob => "blob",
            MessageType::Error => "error",
        };
        f.write_str(name)
    }
}

/// Topic, type tag and raw body of one message
///
/// A JSON envelope holds UTF-8 JSON text, a blob envelope opaque bytes with an
/// optional format label, and an error envelope a UTF-8 description.
///
/// # Examples
/// ```
/// use mads_agent::protocol::{Envelope, MessageBody, MessageType};
/// use serde_json::json;
///
/// let envelope = Envelope::json("bridge", r#"{"id":1}"#);
/// assert_eq!(envelope.message_type(), MessageType::Json);
/// assert_eq!(envelope.decode_body().unwrap(), MessageBody::Json(json!({"id": 1})));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    topic: String,
    message_type: MessageType,
    body: Bytes,
    format: Option<String>,
}

impl Envelope {
    pub fn json(topic: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message_type: MessageType::Json,
            body: Bytes::from(text.into()),
            format: None,
        }
    }

    pub fn blob(topic: impl Into<String>, data: impl Into<Bytes>, format: Option<String>) -> Self {
        Self {
            topic: topic.into(),
            message_type: MessageType::Blob,
            body: data.into(),
            format,
        }
    }

    pub fn error(topic: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message_type: MessageType::Error,
            body: Bytes::from(description.into()),
            format: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Format label of a blob body
    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    /// Interpret the body according to the type tag
    pub fn decode_body(&self) -> Result<MessageBody, serde_json::Error> {
        match self.message_type {
            MessageType::Json => serde_json::from_slice(&self.body).map(MessageBody::Json),
            MessageType::Blob => Ok(MessageBody::Blob {
                format: self.format.clone(),
                data: self.body.clone(),
            }),
            MessageType::Error | MessageType::None => Ok(MessageBody::Error(
                String::from_utf8_lossy(&self.body).into_owned(),
            )),
        }
    }
}

/// Decoded body of the last received message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Json(Value),
    Blob { format: Option<String>, data: Bytes },
    Error(String),
}

impl MessageBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            MessageBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&str> {
        match self {
            MessageBody::Error(description) => Some(description),
            _ => None,
        }
    }
}

impl fmt::Display for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageBody::Json(value) => write!(f, "{value}"),
            MessageBody::Blob { format, data } => write!(
                f,
                "<blob {} bytes, format {}>",
                data.len(),
                format.as_deref().unwrap_or("unknown")
            ),
            MessageBody::Error(description) => f.write_str(description),
        }
    }
}

/// Lifecycle and marker events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Marker,
    MarkerIn,
    MarkerOut,
    Startup,
    Shutdown,
    Message,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Marker => "marker",
            EventType::MarkerIn => "marker_in",
            EventType::MarkerOut => "marker_out",
            EventType::Startup => "startup",
            EventType::Shutdown => "shutdown",
            EventType::Message => "message",
        };
        f.write_str(name)
    }
}

/// Timestamp in extended-JSON form: `{"$date": "<ISO-8601>"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "$date")]
    pub date: DateTime<Utc>,
}

impl Timestamp {
    pub fn now() -> Self {
        Self { date: Utc::now() }
    }
}

/// Event notification published on the metadata topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub name: String,
    pub id: String,
    /// Library version of the sender
    pub version: String,
    pub event: EventType,
    pub settings_path: String,
    pub settings: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    pub hostname: String,
    pub timestamp: Timestamp,
}

/// Body of a settings request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsRequest {
    pub agent: String,
}

/// Remote control command: `{"cmd": "shutdown"}` or `{"cmd": "restart"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlCommand {
    Shutdown,
    Restart,
}
