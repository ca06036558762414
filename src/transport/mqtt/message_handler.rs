//! Pure frame codec and event routing for the MQTT client
//!
//! Envelopes map onto MQTT v5 publishes: the topic is the publish topic, the
//! body is the payload and the type tag travels as the content type. Blob
//! formats ride along as a `format` user property.

use crate::protocol::{Envelope, MessageType};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::Event;
use tracing::debug;

use super::connection::MqttError;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_BLOB: &str = "application/octet-stream";
pub const CONTENT_TYPE_ERROR: &str = "application/vnd.mads.error";

/// User property naming the format of a blob payload
pub const FORMAT_PROPERTY: &str = "format";

/// Pure message routing and conversion
pub struct MessageHandler;

impl MessageHandler {
    /// Payload and properties for publishing an envelope
    pub fn encode_envelope(envelope: &Envelope) -> (Bytes, PublishProperties) {
        let content_type = match envelope.message_type() {
            MessageType::Blob => CONTENT_TYPE_BLOB,
            MessageType::Error => CONTENT_TYPE_ERROR,
            MessageType::Json | MessageType::None => CONTENT_TYPE_JSON,
        };

        let user_properties = envelope
            .format()
            .map(|format| vec![(FORMAT_PROPERTY.to_string(), format.to_string())])
            .unwrap_or_default();

        let properties = PublishProperties {
            content_type: Some(content_type.to_string()),
            user_properties,
            ..Default::default()
        };

        (envelope.body().clone(), properties)
    }

    /// Rebuild an envelope from an inbound publish
    ///
    /// A publish without content type is treated as JSON.
    pub fn decode_publish(publish: &Publish) -> Result<Envelope, MqttError> {
        let topic = std::str::from_utf8(&publish.topic)
            .map_err(|_| MqttError::MalformedFrame("topic is not valid UTF-8".to_string()))?;

        let properties = publish.properties.as_ref();
        let content_type = properties
            .and_then(|p| p.content_type.as_deref())
            .unwrap_or(CONTENT_TYPE_JSON);

        match content_type {
            CONTENT_TYPE_BLOB => {
                let format = properties.and_then(|p| {
                    p.user_properties
                        .iter()
                        .find(|(key, _)| key == FORMAT_PROPERTY)
                        .map(|(_, value)| value.clone())
                });
                Ok(Envelope::blob(topic, publish.payload.clone(), format))
            }
            CONTENT_TYPE_ERROR => Ok(Envelope::error(
                topic,
                String::from_utf8_lossy(&publish.payload).into_owned(),
            )),
            _ => {
                let text = String::from_utf8(publish.payload.to_vec()).map_err(|_| {
                    MqttError::MalformedFrame(format!("JSON payload on {topic} is not UTF-8"))
                })?;
                Ok(Envelope::json(topic, text))
            }
        }
    }

    /// Properties of a settings request expecting a reply on `reply_topic`
    pub fn settings_request_properties(reply_topic: &str, correlation: Bytes) -> PublishProperties {
        PublishProperties {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            response_topic: Some(reply_topic.to_string()),
            correlation_data: Some(correlation),
            ..Default::default()
        }
    }

    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event, reply_topic: &str) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) if publish.topic == reply_topic.as_bytes() => {
                    let correlation = publish
                        .properties
                        .as_ref()
                        .and_then(|p| p.correlation_data.clone());
                    EventRoute::SettingsReply {
                        correlation,
                        payload: publish.payload.clone(),
                    }
                }
                Packet::Publish(publish) => match Self::decode_publish(publish) {
                    Ok(envelope) => EventRoute::MessageReceived(envelope),
                    Err(e) => EventRoute::MalformedMessage(e.to_string()),
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => {
                debug!(target: "mqtt_transport", "Outgoing: {:?}", outgoing);
                EventRoute::OutgoingEvent
            }
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Data message received on a subscribed topic
    MessageReceived(Envelope),
    /// Publish on this client's settings reply topic
    SettingsReply {
        correlation: Option<Bytes>,
        payload: Bytes,
    },
    /// Publish that could not be turned into an envelope
    MalformedMessage(String),
    /// Broker closed the session
    Disconnected(String),
    /// Infrastructure event (PingResp, SubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
