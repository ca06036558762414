//! Event Registrar
//!
//! Builds lifecycle and marker event frames and wraps them in JSON envelopes
//! on the metadata topic. Sending is left to the caller; events are fire and
//! forget with no broker reply.

use crate::agent::settings::Settings;
use crate::config::version;
use crate::error::{AgentError, AgentResult};
use crate::protocol::{Envelope, EventFrame, EventType, Timestamp, METADATA_TOPIC};
use serde_json::{json, Value};

/// Identity fields copied into every event frame
#[derive(Debug, Clone, Copy)]
pub struct EventSource<'a> {
    pub name: &'a str,
    pub id: &'a str,
    pub settings_path: &'a str,
    pub settings: &'a Settings,
}

#[derive(Debug, Clone)]
pub struct EventRegistrar {
    hostname: String,
}

impl EventRegistrar {
    pub fn new() -> Self {
        Self {
            hostname: local_hostname(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn build_frame(&self, source: EventSource<'_>, event: EventType, info: Option<Value>) -> EventFrame {
        EventFrame {
            name: source.name.to_string(),
            id: source.id.to_string(),
            version: version().to_string(),
            event,
            settings_path: source.settings_path.to_string(),
            settings: source.settings.as_map().clone(),
            info,
            hostname: self.hostname.clone(),
            timestamp: Timestamp::now(),
        }
    }

    /// Event frame as a JSON envelope on the metadata topic
    pub fn envelope(
        &self,
        source: EventSource<'_>,
        event: EventType,
        info: Option<Value>,
    ) -> AgentResult<Envelope> {
        let frame = self.build_frame(source, event, info);
        let text = serde_json::to_string(&frame).map_err(|e| AgentError::encoding(e.to_string()))?;
        Ok(Envelope::json(METADATA_TOPIC, text))
    }

    /// Shutdown frame the broker publishes if the connection drops
    pub fn last_will(&self, source: EventSource<'_>) -> AgentResult<Envelope> {
        self.envelope(
            source,
            EventType::Shutdown,
            Some(json!({"reason": "connection lost"})),
        )
    }
}

/// Host name from the OS, then `HOSTNAME`, then `"unknown"`
fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

impl Default for EventRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageBody, MessageType};

    fn source(settings: &Settings) -> EventSource<'_> {
        EventSource {
            name: "feedback",
            id: "feedback-0a1b2c3d",
            settings_path: "mqtt://localhost:1883",
            settings,
        }
    }

    #[test]
    fn test_event_envelope_shape() {
        let settings = Settings::default();
        let registrar = EventRegistrar::new();
        let envelope = registrar
            .envelope(source(&settings), EventType::Startup, None)
            .unwrap();

        assert_eq!(envelope.topic(), METADATA_TOPIC);
        assert_eq!(envelope.message_type(), MessageType::Json);

        let MessageBody::Json(body) = envelope.decode_body().unwrap() else {
            panic!("event frames are JSON");
        };
        assert_eq!(body["event"], "startup");
        assert_eq!(body["name"], "feedback");
        assert_eq!(body["id"], "feedback-0a1b2c3d");
        assert_eq!(body["version"], version());
        assert!(body["timestamp"]["$date"].is_string());
        assert!(body.get("info").is_none());
    }

    #[test]
    fn test_hostname_comes_from_os() {
        let registrar = EventRegistrar::new();
        assert!(!registrar.hostname().is_empty());
        if let Ok(os_name) = hostname::get() {
            if let Some(os_name) = os_name.to_str().filter(|name| !name.is_empty()) {
                assert_eq!(registrar.hostname(), os_name);
            }
        }
    }

    #[test]
    fn test_event_info_is_carried() {
        let settings = Settings::default();
        let frame = EventRegistrar::new().build_frame(
            source(&settings),
            EventType::MarkerIn,
            Some(json!({"lap": 3})),
        );
        assert_eq!(frame.event, EventType::MarkerIn);
        assert_eq!(frame.info, Some(json!({"lap": 3})));
    }

    #[test]
    fn test_last_will_is_shutdown_frame() {
        let settings = Settings::default();
        let envelope = EventRegistrar::new().last_will(source(&settings)).unwrap();
        let frame: EventFrame = serde_json::from_slice(envelope.body()).unwrap();

        assert_eq!(frame.event, EventType::Shutdown);
        assert_eq!(frame.info, Some(json!({"reason": "connection lost"})));
    }
}
