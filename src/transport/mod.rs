//! Transport layer between an agent and its broker
//!
//! The agent never talks to a broker library directly: it asks a
//! [`TransportFactory`] for a [`Transport`] at creation time and drives it
//! through this trait. The MQTT implementation lives in [`mqtt`]; tests inject
//! the in-process transport from `testing::mocks`.

use crate::config::{BrokerConfig, KeyMaterial};
use crate::protocol::Envelope;
use serde_json::Value;
use std::time::Duration;

pub mod mqtt;

/// Everything a transport needs to open a connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub broker: BrokerConfig,
    /// TLS material; plain TCP when absent
    pub key_material: Option<KeyMaterial>,
    pub auth_verbose: bool,
    /// Topic filters subscribed as soon as the connection is up
    pub subscriptions: Vec<String>,
    /// Published by the broker if the connection drops unexpectedly
    pub last_will: Option<Envelope>,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>, broker: BrokerConfig) -> Self {
        Self {
            client_id: client_id.into(),
            broker,
            key_material: None,
            auth_verbose: false,
            subscriptions: Vec::new(),
            last_will: None,
        }
    }
}

/// Transport trait for broker communication
///
/// Implementations own their connection exclusively. `receive` waits for the
/// next inbound envelope and is cancel-safe: the caller bounds it with a
/// timeout or a shutdown signal and drops the future.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the connection and subscribe to the initial topics
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), Self::Error>;

    /// Close the connection
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter on the live connection
    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    /// Send one envelope to the broker
    async fn send(&self, envelope: &Envelope) -> Result<(), Self::Error>;

    /// Wait for the next inbound envelope, in broker delivery order
    async fn receive(&mut self) -> Result<Envelope, Self::Error>;

    /// Next inbound envelope if one is already pending
    fn try_receive(&mut self) -> Result<Option<Envelope>, Self::Error>;

    /// Request this agent's settings document; `Ok(None)` when no reply arrives in time
    async fn request_settings(
        &mut self,
        agent_name: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;
}

/// Creates one transport per agent
pub trait TransportFactory {
    type Transport: Transport;
    type Error: std::error::Error + Send + Sync + 'static;

    fn create(&self, agent_name: &str) -> Result<Self::Transport, Self::Error>;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
