//! MADS agent - Rust implementation
//!
//! A client-side messaging agent: it attaches to a broker, announces lifecycle
//! events, exchanges JSON and binary messages on named topics and exposes
//! broker-negotiated settings to the hosting application.
//!
//! # Overview
//!
//! - [`Agent`]: lifecycle state machine composing the connection, settings,
//!   events and message channel
//! - [`protocol`]: envelopes, event frames and topic rules
//! - [`transport`]: the transport seam and its MQTT v5 implementation
//! - [`config`]: settings sources, local settings files and crypto material
//! - [`testing`]: in-process broker for exercising agents in tests
//!
//! # Quick Start
//!
//! ```rust
//! use mads_agent::testing::{MockBroker, MockTransportFactory};
//! use mads_agent::{Agent, EventType, MessageType};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! let mut agent = Agent::create("feedback", None, &MockTransportFactory::new(broker.clone())).unwrap();
//!
//! agent.init(false).unwrap();
//! agent.connect(Duration::ZERO).await.unwrap();
//! agent.register_event(EventType::Startup, None).await.unwrap();
//! agent.publish("bridge", &json!({"id": 1})).await.unwrap();
//! assert_eq!(agent.receive(true).await.unwrap(), MessageType::None);
//! agent.register_event(EventType::Shutdown, None).await.unwrap();
//! agent.disconnect().await.unwrap();
//!
//! assert_eq!(broker.sent_on("bridge").len(), 1);
//! # });
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use agent::{Agent, AgentInfo, AgentState, LoopControl, LoopStep, Settings, ShutdownHandle};
pub use config::{default_settings_uri, version};
pub use error::{AgentError, AgentResult, ErrorKind};
pub use protocol::{ControlCommand, Envelope, EventType, MessageBody, MessageType};
pub use transport::mqtt::{MqttClient, MqttTransportFactory};
