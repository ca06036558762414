//! Message Channel
//!
//! Encodes outgoing payloads into envelopes and keeps track of what came in:
//! the last envelope, the latest JSON text per topic and the latest blob.

use crate::error::{AgentError, AgentResult};
use crate::protocol::{validate_publish_topic, Envelope, MessageBody, MessageType};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Latest blob received: topic, format label and bytes
pub type BlobRecord = (String, Option<String>, Bytes);

#[derive(Debug, Default)]
pub struct MessageChannel {
    last: Option<Envelope>,
    status: BTreeMap<String, String>,
    last_blob: Option<BlobRecord>,
}

fn check_topic(topic: &str) -> AgentResult<()> {
    validate_publish_topic(topic).map_err(|e| AgentError::encoding(e.to_string()))
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a structured payload into a JSON envelope
    pub fn encode<P: Serialize + ?Sized>(&self, topic: &str, payload: &P) -> AgentResult<Envelope> {
        check_topic(topic)?;
        let text = serde_json::to_string(payload).map_err(|e| AgentError::encoding(e.to_string()))?;
        Ok(Envelope::json(topic, text))
    }

    /// Wrap pre-serialized JSON text; the text must parse as JSON
    pub fn encode_str(&self, topic: &str, text: &str) -> AgentResult<Envelope> {
        check_topic(topic)?;
        serde_json::from_str::<serde::de::IgnoredAny>(text)
            .map_err(|e| AgentError::encoding(format!("payload is not valid JSON: {e}")))?;
        Ok(Envelope::json(topic, text))
    }

    pub fn encode_blob(
        &self,
        topic: &str,
        data: impl Into<Bytes>,
        format: Option<&str>,
    ) -> AgentResult<Envelope> {
        check_topic(topic)?;
        Ok(Envelope::blob(topic, data, format.map(str::to_string)))
    }

    /// Record a received envelope and report its type
    pub fn accept(&mut self, envelope: Envelope) -> MessageType {
        let message_type = envelope.message_type();
        debug!(topic = envelope.topic(), %message_type, bytes = envelope.body().len(), "Message received");

        match message_type {
            MessageType::Json => {
                self.status.insert(
                    envelope.topic().to_string(),
                    String::from_utf8_lossy(envelope.body()).into_owned(),
                );
            }
            MessageType::Blob => {
                self.last_blob = Some((
                    envelope.topic().to_string(),
                    envelope.format().map(str::to_string),
                    envelope.body().clone(),
                ));
            }
            MessageType::Error | MessageType::None => {}
        }

        self.last = Some(envelope);
        message_type
    }

    /// Topic and decoded body of the last received message
    pub fn last_message(&self) -> AgentResult<Option<(String, MessageBody)>> {
        let Some(envelope) = &self.last else {
            return Ok(None);
        };

        let body = envelope.decode_body().map_err(|e| {
            AgentError::decoding(format!("message on '{}': {e}", envelope.topic()))
        })?;
        Ok(Some((envelope.topic().to_string(), body)))
    }

    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.last.as_ref()
    }

    /// Latest JSON text received per topic
    pub fn status(&self) -> &BTreeMap<String, String> {
        &self.status
    }

    pub fn last_blob(&self) -> Option<&BlobRecord> {
        self.last_blob.as_ref()
    }
}
