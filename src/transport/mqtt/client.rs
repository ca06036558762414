//! Impure I/O operations for the MQTT client
//!
//! The `rumqttc` event loop runs in a spawned task. It forwards inbound
//! envelopes to the owning client through a bounded channel, in the order the
//! broker delivered them, and completes pending settings requests by
//! correlation data. A lost connection is reported once and not re-established.
//!
//! The event loop never waits on the inbound channel: when the owner stops
//! receiving and the buffer fills up, new envelopes are dropped so keep-alive,
//! acknowledgements and settings replies keep flowing.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError};
use super::message_handler::{EventRoute, MessageHandler};
use crate::protocol::{settings_reply_topic, Envelope, SettingsRequest, SETTINGS_REQUEST_TOPIC};
use crate::transport::{ConnectOptions, Transport, TransportFactory};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request queue between client and event loop
const REQUEST_CAPACITY: usize = 64;

/// Inbound envelopes buffered before new ones are dropped
const INBOUND_CAPACITY: usize = 1024;

const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type PendingSettings = Arc<Mutex<HashMap<Bytes, oneshot::Sender<Bytes>>>>;

/// MQTT v5 transport
pub struct MqttClient {
    agent_name: String,
    client: Option<AsyncClient>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    inbound_rx: Option<mpsc::Receiver<Envelope>>,
    pending_settings: PendingSettings,
    reply_topic: Option<String>,
    closing: Arc<AtomicBool>,
    shutdown_tx: Option<watch::Sender<bool>>,
    event_loop_handle: Option<JoinHandle<()>>,
    subscribed_topics: Vec<String>,
}

impl MqttClient {
    pub fn new(agent_name: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            client: None,
            state_rx: None,
            inbound_rx: None,
            pending_settings: Arc::new(Mutex::new(HashMap::new())),
            reply_topic: None,
            closing: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            event_loop_handle: None,
            subscribed_topics: Vec::new(),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Topics subscribed on the current connection
    pub fn subscribed_topics(&self) -> &[String] {
        &self.subscribed_topics
    }

    /// Get current connection state
    /// Returns None if connection hasn't been established yet
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed(reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::Idle | ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_event_loop(
        mut event_loop: EventLoop,
        client_id: String,
        reply_topic: String,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
        inbound_tx: mpsc::Sender<Envelope>,
        pending_settings: PendingSettings,
        closing: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(client_id = %client_id, "Starting MQTT event loop");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!(client_id = %client_id, "Shutdown signal received, stopping event loop");
                            break;
                        }
                    }
                    event_result = event_loop.poll() => {
                        match event_result {
                            Ok(event) => {
                                let route = MessageHandler::route_mqtt_event(&event, &reply_topic);
                                if !Self::process_event_route(
                                    route,
                                    &state_tx,
                                    &inbound_tx,
                                    &pending_settings,
                                )
                                .await
                                {
                                    break;
                                }
                            }
                            Err(e) => {
                                if closing.load(Ordering::SeqCst) {
                                    debug!(client_id = %client_id, "Event loop closed: {}", e);
                                } else {
                                    error!(client_id = %client_id, error = %e, "MQTT connection lost");
                                    let _ = state_tx.send(ConnectionState::Closed(e.to_string()));
                                }
                                break;
                            }
                        }
                    }
                }
            }

            // Pending settings requests fail fast instead of waiting out their timeout
            pending_settings.lock().await.clear();
            info!(client_id = %client_id, "MQTT event loop stopped");
        })
    }

    /// Process routed MQTT event
    /// Returns true to continue loop, false to break
    async fn process_event_route(
        route: EventRoute,
        state_tx: &watch::Sender<ConnectionState>,
        inbound_tx: &mpsc::Sender<Envelope>,
        pending_settings: &PendingSettings,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let _ = state_tx.send(ConnectionState::Connected);
                true
            }
            EventRoute::MessageReceived(envelope) => {
                debug!(target: "mqtt_transport", topic = %envelope.topic(), kind = %envelope.message_type(), "Received envelope");
                match inbound_tx.try_send(envelope) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(envelope)) => {
                        warn!(
                            topic = %envelope.topic(),
                            capacity = inbound_tx.max_capacity(),
                            "Inbound buffer full, dropping envelope"
                        );
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(target: "mqtt_transport", "Inbound receiver dropped, stopping event loop");
                        false
                    }
                }
            }
            EventRoute::SettingsReply {
                correlation,
                payload,
            } => {
                let waiter = match correlation {
                    Some(correlation) => pending_settings.lock().await.remove(&correlation),
                    None => None,
                };
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(payload);
                    }
                    None => warn!("Discarding settings reply without a matching request"),
                }
                true
            }
            EventRoute::MalformedMessage(reason) => {
                warn!("Dropping malformed MQTT message: {}", reason);
                true
            }
            EventRoute::Disconnected(reason) => {
                warn!("Broker closed the connection: {}", reason);
                let _ = state_tx.send(ConnectionState::Closed(reason));
                false
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<&AsyncClient, MqttError> {
        let current_state = self.connection_state().unwrap_or(ConnectionState::Idle);
        match &self.client {
            Some(client) if current_state.can_publish() => Ok(client),
            _ => Err(MqttError::NotConnected {
                state: current_state,
            }),
        }
    }

    async fn subscribe_initial(&mut self, reply_topic: &str, topics: &[String]) -> Result<(), MqttError> {
        self.subscribe(reply_topic).await?;
        for topic in topics {
            self.subscribe(topic).await?;
        }
        Ok(())
    }

    /// Tear down a half-established connection so `connect` can be retried
    async fn abandon_connection(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.stop_event_loop();
        self.client = None;
        self.state_rx = None;
        self.inbound_rx = None;
        self.reply_topic = None;
        self.subscribed_topics.clear();
        self.pending_settings.lock().await.clear();
    }

    fn stop_event_loop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), Self::Error> {
        if self.client.is_some() {
            return Err(MqttError::ConnectionFailedStr(
                "Event loop already started".to_string(),
            ));
        }

        let mqtt_options = configure_mqtt_options(options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let reply_topic = settings_reply_topic(&options.client_id);
        self.closing.store(false, Ordering::SeqCst);

        let handle = Self::spawn_event_loop(
            event_loop,
            options.client_id.clone(),
            reply_topic.clone(),
            state_tx,
            shutdown_rx,
            inbound_tx,
            self.pending_settings.clone(),
            self.closing.clone(),
        );

        self.shutdown_tx = Some(shutdown_tx);
        self.event_loop_handle = Some(handle);

        if let Err(e) =
            Self::wait_for_connection_confirmation(state_rx.clone(), CONNACK_TIMEOUT).await
        {
            self.stop_event_loop();
            return Err(e);
        }

        self.client = Some(client);
        self.state_rx = Some(state_rx);
        self.inbound_rx = Some(inbound_rx);
        self.reply_topic = Some(reply_topic.clone());
        self.subscribed_topics.clear();

        if let Err(e) = self.subscribe_initial(&reply_topic, &options.subscriptions).await {
            warn!(client_id = %options.client_id, error = %e, "Initial subscriptions failed, closing connection");
            self.abandon_connection().await;
            return Err(e);
        }

        info!(
            client_id = %options.client_id,
            broker = %options.broker.broker_url,
            "MQTT client connected"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };

        self.closing.store(true, Ordering::SeqCst);
        let result = client
            .disconnect()
            .await
            .map_err(|e| MqttError::ConnectionFailed(Box::new(e)));

        // Let the event loop flush the DISCONNECT packet before tearing it down
        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => warn!("Event loop task didn't shut down gracefully, forcing abort"),
            }
        }
        self.stop_event_loop();

        self.state_rx = None;
        self.inbound_rx = None;
        self.reply_topic = None;
        self.pending_settings.lock().await.clear();

        info!(agent = %self.agent_name, "MQTT client disconnected");
        result
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        let client = self.check_connection_state()?;
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        debug!(target: "mqtt_transport", "Subscribed to: {}", topic);
        self.subscribed_topics.push(topic.to_string());
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), Self::Error> {
        let client = self.check_connection_state()?;
        let (payload, properties) = MessageHandler::encode_envelope(envelope);

        client
            .publish_with_properties(
                envelope.topic(),
                QoS::AtLeastOnce,
                false,
                payload,
                properties,
            )
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(
            target: "mqtt_transport",
            topic = %envelope.topic(),
            kind = %envelope.message_type(),
            bytes = envelope.body().len(),
            "Published envelope"
        );
        Ok(())
    }

    async fn receive(&mut self) -> Result<Envelope, Self::Error> {
        let inbound = self.inbound_rx.as_mut().ok_or(MqttError::NotConnected {
            state: ConnectionState::Idle,
        })?;
        inbound.recv().await.ok_or(MqttError::ConnectionClosed)
    }

    fn try_receive(&mut self) -> Result<Option<Envelope>, Self::Error> {
        let inbound = self.inbound_rx.as_mut().ok_or(MqttError::NotConnected {
            state: ConnectionState::Idle,
        })?;
        match inbound.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(MqttError::ConnectionClosed),
        }
    }

    async fn request_settings(
        &mut self,
        agent_name: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, Self::Error> {
        let client = self.check_connection_state()?;
        let reply_topic = self
            .reply_topic
            .clone()
            .ok_or(MqttError::NotConnected {
                state: ConnectionState::Idle,
            })?;

        let correlation = Bytes::from(uuid::Uuid::new_v4().to_string());
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_settings
            .lock()
            .await
            .insert(correlation.clone(), reply_tx);

        let request = SettingsRequest {
            agent: agent_name.to_string(),
        };
        let payload = serde_json::to_vec(&request).map_err(MqttError::SerializationError)?;
        let properties = MessageHandler::settings_request_properties(&reply_topic, correlation.clone());

        if let Err(e) = client
            .publish_with_properties(SETTINGS_REQUEST_TOPIC, QoS::AtLeastOnce, false, payload, properties)
            .await
        {
            self.pending_settings.lock().await.remove(&correlation);
            return Err(MqttError::PublishFailed(Box::new(e)));
        }
        debug!(agent = %agent_name, reply_topic = %reply_topic, "Settings requested");

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(payload)) => serde_json::from_slice(&payload)
                .map(Some)
                .map_err(MqttError::SerializationError),
            Ok(Err(_)) => Err(MqttError::ConnectionClosed),
            Err(_) => {
                self.pending_settings.lock().await.remove(&correlation);
                Ok(None)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
            && self
                .connection_state()
                .map(|state| state.can_publish())
                .unwrap_or(false)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // No async in Drop: only the background task is cleaned up here
        self.stop_event_loop();
    }
}

/// Creates one unconnected [`MqttClient`] per agent
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    type Transport = MqttClient;
    type Error = MqttError;

    fn create(&self, agent_name: &str) -> Result<Self::Transport, Self::Error> {
        Ok(MqttClient::new(agent_name))
    }
}
