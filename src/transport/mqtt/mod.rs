//! MQTT v5 transport
//!
//! The module is split into focused sub-modules that separate pure functions
//! from I/O:
//!
//! - [`connection`] - Pure connection configuration and state
//! - [`message_handler`] - Pure envelope codec and event routing
//! - [`client`] - Event loop task and the [`Transport`](crate::transport::Transport) implementation
//!
//! # Usage
//!
//! ```rust,no_run
//! use mads_agent::config::BrokerConfig;
//! use mads_agent::protocol::Envelope;
//! use mads_agent::transport::mqtt::MqttClient;
//! use mads_agent::transport::{ConnectOptions, Transport};
//!
//! # tokio_test::block_on(async {
//! let mut client = MqttClient::new("bridge");
//! let options = ConnectOptions::new("bridge-1", BrokerConfig::for_url("mqtt://localhost:1883"));
//! client.connect(&options).await?;
//! client.send(&Envelope::json("bridge", r#"{"id":1}"#)).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttClient, MqttTransportFactory};
pub use connection::{ConnectionState, MqttError};
pub use message_handler::{EventRoute, MessageHandler};
