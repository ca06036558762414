//! Mock implementations for testing
//!
//! [`MockBroker`] is an in-process stand-in for the broker: it records every
//! frame an agent sends, counts transport calls, lets tests inject inbound
//! envelopes and scripts settings replies. [`MockTransport`] is the agent-side
//! handle onto it, handed out by [`MockTransportFactory`].

use crate::protocol::Envelope;
use crate::transport::{ConnectOptions, Transport, TransportFactory};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Errors produced by the mock transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockTransportError {
    #[error("Mock allocation failure")]
    AllocationFailed,
    #[error("Mock connection refused")]
    ConnectionRefused,
    #[error("Mock send failure")]
    SendFailed,
    #[error("Mock subscribe failure")]
    SubscribeFailed,
    #[error("Mock transport not connected")]
    NotConnected,
    #[error("Mock connection closed")]
    ConnectionClosed,
}

/// Scripted answer to one settings request
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsReply {
    Document(Value),
    /// No reply; the request times out
    Silence,
}

#[derive(Debug, Default)]
struct BrokerState {
    connected: bool,
    fail_connect: bool,
    fail_send: bool,
    fail_subscribe: bool,
    io_operations: usize,
    connects: usize,
    disconnects: usize,
    last_connect_options: Option<ConnectOptions>,
    sent: Vec<Envelope>,
    subscriptions: Vec<String>,
    inbound: VecDeque<Envelope>,
    settings_requests: Vec<String>,
    settings_replies: VecDeque<SettingsReply>,
}

/// In-process broker shared between a test and the agent under test
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    inbound_ready: Arc<Notify>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Transport handle connected to this broker
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            broker: self.clone(),
        }
    }

    /// Queue an envelope for delivery to the agent
    pub fn inject(&self, envelope: Envelope) {
        self.state().inbound.push_back(envelope);
        self.inbound_ready.notify_one();
    }

    /// Answer the next settings request with `document`
    pub fn reply_settings(&self, document: Value) {
        self.state()
            .settings_replies
            .push_back(SettingsReply::Document(document));
    }

    /// Leave the next settings request unanswered
    pub fn silence_settings(&self) {
        self.state().settings_replies.push_back(SettingsReply::Silence);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn fail_send(&self, fail: bool) {
        self.state().fail_send = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state().fail_subscribe = fail;
    }

    /// Simulate the broker going away
    pub fn drop_connection(&self) {
        self.state().connected = false;
        self.inbound_ready.notify_one();
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.state().sent.clone()
    }

    pub fn sent_on(&self, topic: &str) -> Vec<Envelope> {
        self.state()
            .sent
            .iter()
            .filter(|envelope| envelope.topic() == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    pub fn settings_requests(&self) -> Vec<String> {
        self.state().settings_requests.clone()
    }

    /// Number of transport calls made so far
    pub fn io_count(&self) -> usize {
        self.state().io_operations
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    pub fn last_connect_options(&self) -> Option<ConnectOptions> {
        self.state().last_connect_options.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn pending_inbound(&self) -> usize {
        self.state().inbound.len()
    }

    pub fn clear_history(&self) {
        let mut state = self.state();
        state.sent.clear();
        state.settings_requests.clear();
        state.io_operations = 0;
    }
}

/// Mock transport for testing
#[derive(Debug, Clone)]
pub struct MockTransport {
    broker: MockBroker,
}

impl MockTransport {
    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }

    /// Record one transport call and check the connection
    fn begin_io(&self) -> Result<MutexGuard<'_, BrokerState>, MockTransportError> {
        let mut state = self.broker.state();
        state.io_operations += 1;
        if state.connected {
            Ok(state)
        } else {
            Err(MockTransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), Self::Error> {
        let mut state = self.broker.state();
        state.io_operations += 1;
        state.last_connect_options = Some(options.clone());
        if state.fail_connect {
            return Err(MockTransportError::ConnectionRefused);
        }
        state.connected = true;
        state.connects += 1;
        state.subscriptions.extend(options.subscriptions.iter().cloned());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        let mut state = self.broker.state();
        state.io_operations += 1;
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        let mut state = self.begin_io()?;
        if state.fail_subscribe {
            return Err(MockTransportError::SubscribeFailed);
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), Self::Error> {
        let mut state = self.begin_io()?;
        if state.fail_send {
            return Err(MockTransportError::SendFailed);
        }
        state.sent.push(envelope.clone());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Envelope, Self::Error> {
        drop(self.begin_io()?);
        loop {
            {
                let mut state = self.broker.state();
                if !state.connected {
                    return Err(MockTransportError::ConnectionClosed);
                }
                if let Some(envelope) = state.inbound.pop_front() {
                    return Ok(envelope);
                }
            }
            self.broker.inbound_ready.notified().await;
        }
    }

    fn try_receive(&mut self) -> Result<Option<Envelope>, Self::Error> {
        let mut state = self.begin_io()?;
        Ok(state.inbound.pop_front())
    }

    async fn request_settings(
        &mut self,
        agent_name: &str,
        _timeout: Duration,
    ) -> Result<Option<Value>, Self::Error> {
        let mut state = self.begin_io()?;
        state.settings_requests.push(agent_name.to_string());
        match state.settings_replies.pop_front() {
            Some(SettingsReply::Document(document)) => Ok(Some(document)),
            Some(SettingsReply::Silence) | None => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.broker.state().connected
    }
}

/// Factory handing out transports bound to one [`MockBroker`]
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    broker: MockBroker,
    fail: bool,
}

impl MockTransportFactory {
    pub fn new(broker: MockBroker) -> Self {
        Self {
            broker,
            fail: false,
        }
    }

    /// Factory whose transports cannot be allocated
    pub fn failing() -> Self {
        Self {
            broker: MockBroker::new(),
            fail: true,
        }
    }

    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }
}

impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;
    type Error = MockTransportError;

    fn create(&self, _agent_name: &str) -> Result<Self::Transport, Self::Error> {
        if self.fail {
            Err(MockTransportError::AllocationFailed)
        } else {
            Ok(self.broker.transport())
        }
    }
}
