//! Agent lifecycle and pub/sub orchestration
//!
//! [`Agent`] composes the Connection Manager, Settings Store, Event Registrar
//! and Message Channel behind one state machine:
//!
//! ```text
//! create → init → connect → register/publish/receive → disconnect → destroy
//! ```
//!
//! Every operation checks the lifecycle state before doing anything else, so
//! calls made out of order fail with `InvalidState` and never reach the
//! transport. Failures are also recorded and readable through
//! [`Agent::last_error`] until the next successful operation.
//!
//! # Examples
//!
//! ```no_run
//! use mads_agent::{Agent, EventType, MqttTransportFactory};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> mads_agent::AgentResult<()> {
//! let mut agent = Agent::create("feedback", None, &MqttTransportFactory)?;
//! agent.init(false)?;
//! agent.connect(Duration::from_millis(250)).await?;
//! agent.register_event(EventType::Startup, None).await?;
//! agent.publish("bridge", &json!({"id": 1})).await?;
//! agent.register_event(EventType::Shutdown, None).await?;
//! agent.disconnect().await?;
//! agent.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod connection;
pub mod events;
pub mod lifecycle;
pub mod main_loop;
pub mod settings;

pub use channel::{BlobRecord, MessageChannel};
pub use connection::{ConnectionManager, LastError, ShutdownHandle};
pub use events::{EventRegistrar, EventSource};
pub use lifecycle::{AgentState, Operation};
pub use main_loop::{LoopControl, LoopStep};
pub use settings::{Settings, SettingsStore};

use crate::config::{normalize_agent_name, ConfigError, DEFAULT_SETTINGS_URI};
use crate::error::{AgentError, AgentResult, ErrorKind};
use crate::protocol::{
    validate_identity, validate_publish_topic, validate_subscribe_topic, ControlCommand,
    Envelope, EventType, MessageBody, MessageType, CONTROL_TOPIC,
};
use crate::transport::{ConnectOptions, Transport, TransportFactory};
use crate::{lifecycle_span, message_span};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Snapshot of an agent's identity and configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AgentInfo {
    pub name: String,
    pub id: String,
    pub settings_uri: String,
    pub broker_url: String,
    pub pub_topic: String,
    pub subscriptions: Vec<String>,
    pub crypto_enabled: bool,
    pub state: AgentState,
}

impl fmt::Display for AgentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Agent:         {}", self.name)?;
        writeln!(f, "  id:          {}", self.id)?;
        writeln!(f, "  settings:    {}", self.settings_uri)?;
        writeln!(f, "  broker:      {}", self.broker_url)?;
        writeln!(f, "  pub topic:   {}", self.pub_topic)?;
        writeln!(f, "  sub topics:  {}", self.subscriptions.join(", "))?;
        writeln!(f, "  crypto:      {}", if self.crypto_enabled { "on" } else { "off" })?;
        write!(f, "  state:       {}", self.state)
    }
}

/// One client identity attached to a broker
pub struct Agent<T: Transport> {
    name: String,
    id: String,
    state: AgentState,
    crypto_enabled: bool,
    connection: ConnectionManager<T>,
    settings: SettingsStore,
    registrar: EventRegistrar,
    channel: MessageChannel,
    subscriptions: Vec<String>,
    pub_topic: Option<String>,
    remote_control: bool,
    restart_requested: bool,
    shutdown: ShutdownHandle,
}

fn invalid_identity(what: &str, value: &str, error: impl fmt::Display) -> AgentError {
    ConfigError::InvalidIdentity(format!("{what} '{value}': {error}")).into()
}

fn push_unique(topics: &mut Vec<String>, topic: String) {
    if !topics.contains(&topic) {
        topics.push(topic);
    }
}

impl<T: Transport> Agent<T> {
    /// Allocate an agent and its transport
    ///
    /// `name` is normalised (leading directories and the `mads-` prefix are
    /// dropped). Without `settings_uri` the compiled-in default is used. A
    /// transport the factory cannot create aborts construction.
    pub fn create<F>(name: &str, settings_uri: Option<&str>, factory: &F) -> AgentResult<Self>
    where
        F: TransportFactory<Transport = T>,
    {
        let name = normalize_agent_name(name);
        let transport = factory.create(&name).map_err(|e| {
            AgentError::allocation(format!("cannot create transport for agent '{name}': {e}"))
        })?;

        let shutdown = ShutdownHandle::new();
        let settings_uri = settings_uri.unwrap_or(DEFAULT_SETTINGS_URI);
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{name}-{}", &suffix[..8]);

        debug!(agent = %name, id = %id, settings = settings_uri, "Agent created");

        Ok(Self {
            connection: ConnectionManager::new(transport, shutdown.clone()),
            settings: SettingsStore::new(settings_uri),
            registrar: EventRegistrar::new(),
            channel: MessageChannel::new(),
            name,
            id,
            state: AgentState::Created,
            crypto_enabled: false,
            subscriptions: Vec::new(),
            pub_topic: None,
            remote_control: false,
            restart_requested: false,
            shutdown,
        })
    }

    /// Record the outcome of a fallible operation
    fn track<R>(&mut self, result: AgentResult<R>) -> AgentResult<R> {
        match &result {
            Ok(_) => self.connection.clear_error(),
            Err(error) => self.connection.record_error(error),
        }
        result
    }

    fn event_source(&self) -> EventSource<'_> {
        EventSource {
            name: &self.name,
            id: &self.id,
            settings_path: self.settings.uri(),
            settings: self.settings.settings(),
        }
    }

    // Lifecycle

    /// Validate identity, load local settings and, with `crypto`, key material
    ///
    /// On failure the agent stays in `Created`.
    pub fn init(&mut self, crypto: bool) -> AgentResult<()> {
        let result = self.init_inner(crypto);
        self.track(result)
    }

    fn init_inner(&mut self, crypto: bool) -> AgentResult<()> {
        self.state.require(Operation::Init)?;
        validate_identity(&self.name).map_err(|e| invalid_identity("name", &self.name, e))?;
        validate_identity(&self.id).map_err(|e| invalid_identity("id", &self.id, e))?;

        self.settings.load_local(&self.name)?;
        if crypto {
            self.connection.load_key_material()?;
        }

        self.crypto_enabled = crypto;
        self.state = AgentState::Initialized;
        info!(agent = %self.name, id = %self.id, crypto, "Agent initialized");
        Ok(())
    }

    /// Open the broker connection after an optional `delay`
    ///
    /// On failure the agent stays in `Initialized`.
    pub async fn connect(&mut self, delay: Duration) -> AgentResult<()> {
        let span = lifecycle_span!(agent = %self.name, transition = "connect");
        let result = self.connect_inner(delay).instrument(span).await;
        self.track(result)
    }

    fn initial_subscriptions(&self) -> Vec<String> {
        let mut topics = Vec::new();
        for topic in self
            .subscriptions
            .iter()
            .cloned()
            .chain(self.settings.settings().sub_topics())
        {
            push_unique(&mut topics, topic);
        }
        if self.remote_control {
            push_unique(&mut topics, CONTROL_TOPIC.to_string());
        }
        topics
    }

    async fn connect_inner(&mut self, delay: Duration) -> AgentResult<()> {
        self.state.require(Operation::Connect)?;
        validate_identity(&self.id).map_err(|e| invalid_identity("id", &self.id, e))?;

        let subscriptions = self.initial_subscriptions();
        for topic in &subscriptions {
            validate_subscribe_topic(topic).map_err(|e| AgentError::encoding(e.to_string()))?;
        }

        let mut options = ConnectOptions::new(self.id.clone(), self.settings.broker().clone());
        if self.crypto_enabled {
            options.key_material = Some(self.connection.key_material()?);
            options.auth_verbose = self.connection.crypto().auth_verbose;
        }
        options.subscriptions = subscriptions.clone();
        options.last_will = Some(self.registrar.last_will(self.event_source())?);

        self.connection.connect(&options, delay).await?;

        self.subscriptions = subscriptions;
        self.state = AgentState::Connected;
        info!(
            agent = %self.name,
            id = %self.id,
            subscriptions = ?self.subscriptions,
            "Agent connected"
        );
        Ok(())
    }

    /// Close the connection; a no-op unless connected
    pub async fn disconnect(&mut self) -> AgentResult<()> {
        if self.state.is_connected() {
            self.connection.disconnect().await;
            self.state = AgentState::Disconnected;
            info!(agent = %self.name, "Agent disconnected");
        }
        self.track(Ok(()))
    }

    /// Release every owned resource; safe to call more than once
    ///
    /// Raises the shutdown handle first so a receive pending in another task
    /// returns.
    pub async fn destroy(&mut self) {
        if self.state == AgentState::Destroyed {
            return;
        }
        self.shutdown.trigger();
        if self.state.is_connected() {
            self.connection.disconnect().await;
        }
        self.connection.release();
        self.state = AgentState::Destroyed;
        info!(agent = %self.name, "Agent destroyed");
    }

    // Events and messages

    /// Publish an event frame on the metadata topic
    pub async fn register_event(&mut self, event: EventType, info: Option<Value>) -> AgentResult<()> {
        let result = self.register_event_inner(event, info).await;
        self.track(result)
    }

    async fn register_event_inner(&mut self, event: EventType, info: Option<Value>) -> AgentResult<()> {
        self.state.require(Operation::RegisterEvent)?;
        let envelope = self.registrar.envelope(self.event_source(), event, info)?;
        self.send_envelope(&envelope).await?;
        debug!(agent = %self.name, %event, "Event registered");
        Ok(())
    }

    async fn send_envelope(&self, envelope: &Envelope) -> AgentResult<()> {
        let span = message_span!(
            topic = envelope.topic(),
            message_type = %envelope.message_type(),
            bytes = envelope.body().len()
        );
        self.connection.send(envelope).instrument(span).await
    }

    /// Publish a structured payload as JSON
    pub async fn publish<P>(&mut self, topic: &str, payload: &P) -> AgentResult<()>
    where
        P: Serialize + Sync + ?Sized,
    {
        let result = self.publish_inner(topic, payload).await;
        self.track(result)
    }

    async fn publish_inner<P>(&mut self, topic: &str, payload: &P) -> AgentResult<()>
    where
        P: Serialize + Sync + ?Sized,
    {
        self.state.require(Operation::Publish)?;
        let envelope = self.channel.encode(topic, payload)?;
        self.send_envelope(&envelope).await
    }

    /// Publish pre-serialized JSON text
    pub async fn publish_json(&mut self, topic: &str, text: &str) -> AgentResult<()> {
        let result = self.publish_json_inner(topic, text).await;
        self.track(result)
    }

    async fn publish_json_inner(&mut self, topic: &str, text: &str) -> AgentResult<()> {
        self.state.require(Operation::Publish)?;
        let envelope = self.channel.encode_str(topic, text)?;
        self.send_envelope(&envelope).await
    }

    /// Publish opaque bytes with an optional format label
    pub async fn publish_blob(
        &mut self,
        topic: &str,
        data: impl Into<Bytes>,
        format: Option<&str>,
    ) -> AgentResult<()> {
        let result = self.publish_blob_inner(topic, data.into(), format).await;
        self.track(result)
    }

    async fn publish_blob_inner(&mut self, topic: &str, data: Bytes, format: Option<&str>) -> AgentResult<()> {
        self.state.require(Operation::Publish)?;
        let envelope = self.channel.encode_blob(topic, data, format)?;
        self.send_envelope(&envelope).await
    }

    /// Publish on the agent's own topic
    pub async fn publish_default<P>(&mut self, payload: &P) -> AgentResult<()>
    where
        P: Serialize + Sync + ?Sized,
    {
        let topic = self.pub_topic().to_string();
        self.publish(&topic, payload).await
    }

    /// Wait for the next message, bounded by the receive timeout
    ///
    /// Returns `MessageType::None` when nothing arrives in time, when
    /// `dont_block` is set and nothing is pending, or when shutdown is raised.
    /// An error frame returns `MessageType::Error` and is recorded as a
    /// protocol error.
    pub async fn receive(&mut self, dont_block: bool) -> AgentResult<MessageType> {
        let result = self.receive_inner(dont_block).await;
        let result = self.track(result);

        if let Ok(MessageType::Error) = result {
            let description = self
                .channel
                .last_envelope()
                .map(|envelope| String::from_utf8_lossy(envelope.body()).into_owned())
                .unwrap_or_default();
            self.connection.record_error(&AgentError::protocol(description));
        }
        result
    }

    async fn receive_inner(&mut self, dont_block: bool) -> AgentResult<MessageType> {
        self.state.require(Operation::Receive)?;

        match self.connection.receive(dont_block).await {
            Ok(Some(envelope)) => Ok(self.channel.accept(envelope)),
            Ok(None) => Ok(MessageType::None),
            Err(error) => {
                if !self.connection.is_connected() {
                    warn!(agent = %self.name, "Connection lost while receiving");
                    self.state = AgentState::Disconnected;
                }
                Err(error)
            }
        }
    }

    /// Topic and decoded body of the last received message
    ///
    /// Only a decoding failure is recorded; a successful read leaves the last
    /// error untouched.
    pub fn last_message(&mut self) -> AgentResult<Option<(String, MessageBody)>> {
        let result = self.channel.last_message();
        if let Err(error) = &result {
            self.connection.record_error(error);
        }
        result
    }

    /// Latest JSON text received per topic
    pub fn status(&self) -> &BTreeMap<String, String> {
        self.channel.status()
    }

    pub fn last_blob(&self) -> Option<&BlobRecord> {
        self.channel.last_blob()
    }

    // Settings

    /// Refresh settings from their source, waiting up to `timeout` for the broker
    ///
    /// A timeout keeps the cached settings. New `sub_topic` entries are
    /// subscribed right away; if one of them is invalid or cannot be
    /// subscribed the previous settings are restored.
    pub async fn fetch_settings(&mut self, timeout: Duration) -> AgentResult<&Settings> {
        let span = lifecycle_span!(agent = %self.name, transition = "fetch settings");
        let result = self.fetch_settings_inner(timeout).instrument(span).await;
        self.track(result)?;
        Ok(self.settings.settings())
    }

    async fn fetch_settings_inner(&mut self, timeout: Duration) -> AgentResult<()> {
        self.state.require(Operation::FetchSettings)?;
        let previous = self.settings.clone();
        self.settings
            .fetch(&mut self.connection, &self.name, timeout)
            .await?;

        if let Err(error) = self.subscribe_settings_topics().await {
            warn!(agent = %self.name, error = %error, "Rejecting fetched settings");
            self.settings = previous;
            return Err(error);
        }
        Ok(())
    }

    async fn subscribe_settings_topics(&mut self) -> AgentResult<()> {
        let topics: Vec<String> = self
            .settings
            .settings()
            .sub_topics()
            .into_iter()
            .filter(|topic| !self.subscriptions.contains(topic))
            .collect();
        for topic in &topics {
            validate_subscribe_topic(topic).map_err(|e| AgentError::encoding(e.to_string()))?;
        }

        for topic in topics {
            self.connection.subscribe(&topic).await?;
            self.subscriptions.push(topic);
        }
        Ok(())
    }

    /// Re-read the local settings file
    pub fn reload_settings(&mut self) -> AgentResult<()> {
        let result = self
            .state
            .require(Operation::LoadSettings)
            .and_then(|_| {
                self.settings
                    .load_local(&self.name)
                    .map_err(AgentError::from)
            });
        self.track(result)
    }

    pub fn settings(&self) -> &Settings {
        self.settings.settings()
    }

    pub fn settings_uri(&self) -> &str {
        self.settings.uri()
    }

    pub fn settings_timeout(&self) -> Duration {
        self.settings.timeout()
    }

    pub fn set_settings_timeout(&mut self, timeout: Duration) -> AgentResult<()> {
        let result = self.state.require(Operation::SetTimeout);
        if result.is_ok() {
            self.settings.set_timeout(timeout);
        }
        self.track(result)
    }

    pub fn format_settings(&self, indent: usize) -> String {
        self.settings.settings().format(indent)
    }

    pub fn print_settings(&self, indent: usize) {
        println!("{}", self.format_settings(indent));
    }

    /// Write broker-fetched settings to a local settings file
    pub fn save_settings(&mut self, path: impl AsRef<Path>) -> AgentResult<()> {
        let result = self.settings.save(path.as_ref(), &self.name);
        self.track(result)
    }

    // Identity and configuration

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) -> AgentResult<()> {
        let result = self.state.require(Operation::SetId);
        if result.is_ok() {
            self.id = id.into();
        }
        self.track(result)
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected() && self.connection.is_connected()
    }

    pub fn crypto_enabled(&self) -> bool {
        self.crypto_enabled
    }

    fn configure_crypto(&mut self, apply: impl FnOnce(&mut ConnectionManager<T>)) -> AgentResult<()> {
        let result = self.state.require(Operation::ConfigureCrypto);
        if result.is_ok() {
            apply(&mut self.connection);
        }
        self.track(result)
    }

    pub fn set_key_dir(&mut self, key_dir: impl Into<PathBuf>) -> AgentResult<()> {
        let key_dir = key_dir.into();
        self.configure_crypto(|connection| connection.set_key_dir(key_dir))
    }

    pub fn set_client_key_name(&mut self, name: impl Into<String>) -> AgentResult<()> {
        let name = name.into();
        self.configure_crypto(|connection| connection.set_client_key_name(name))
    }

    pub fn set_server_key_name(&mut self, name: impl Into<String>) -> AgentResult<()> {
        let name = name.into();
        self.configure_crypto(|connection| connection.set_server_key_name(name))
    }

    pub fn set_auth_verbose(&mut self, verbose: bool) -> AgentResult<()> {
        self.configure_crypto(|connection| connection.set_auth_verbose(verbose))
    }

    pub fn receive_timeout(&self) -> Duration {
        self.connection.receive_timeout()
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) -> AgentResult<()> {
        let result = self.state.require(Operation::SetTimeout);
        if result.is_ok() {
            self.connection.set_receive_timeout(timeout);
        }
        self.track(result)
    }

    /// Topic used by [`Agent::publish_default`]
    ///
    /// An explicit [`Agent::set_pub_topic`] wins over the `pub_topic` setting,
    /// which wins over the agent name.
    pub fn pub_topic(&self) -> &str {
        self.pub_topic
            .as_deref()
            .or_else(|| self.settings.settings().pub_topic())
            .unwrap_or(&self.name)
    }

    pub fn set_pub_topic(&mut self, topic: impl Into<String>) -> AgentResult<()> {
        let topic = topic.into();
        let result = self.state.require(Operation::SetPubTopic).and_then(|_| {
            validate_publish_topic(&topic).map_err(|e| AgentError::encoding(e.to_string()))
        });
        if result.is_ok() {
            self.pub_topic = Some(topic);
        }
        self.track(result)
    }

    /// Main loop period taken from the `time_step` setting
    pub fn time_step(&self) -> Duration {
        self.settings.settings().time_step()
    }

    /// Subscribe now if connected, otherwise at connect
    pub async fn subscribe(&mut self, topic: &str) -> AgentResult<()> {
        let result = self.subscribe_inner(topic).await;
        self.track(result)
    }

    async fn subscribe_inner(&mut self, topic: &str) -> AgentResult<()> {
        self.state.require(Operation::Subscribe)?;
        validate_subscribe_topic(topic).map_err(|e| AgentError::encoding(e.to_string()))?;
        if self.subscriptions.iter().any(|t| t == topic) {
            return Ok(());
        }
        if self.state.is_connected() {
            self.connection.subscribe(topic).await?;
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    // Remote control and shutdown

    /// Listen for commands on the control topic once connected
    pub fn enable_remote_control(&mut self) -> AgentResult<()> {
        let result = self.state.require(Operation::EnableRemoteControl);
        if result.is_ok() {
            self.remote_control = true;
        }
        self.track(result)
    }

    /// Act on the last received message if it is a control command
    ///
    /// Both commands raise the shutdown handle; `restart` also sets
    /// [`Agent::restart_requested`].
    pub fn remote_control(&mut self) -> Option<ControlCommand> {
        if !self.remote_control {
            return None;
        }
        let envelope = self.channel.last_envelope()?;
        if envelope.topic() != CONTROL_TOPIC || envelope.message_type() != MessageType::Json {
            return None;
        }

        let command = match serde_json::from_slice::<ControlCommand>(envelope.body()) {
            Ok(command) => command,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Ignoring malformed control message");
                return None;
            }
        };

        info!(agent = %self.name, ?command, "Remote control command received");
        if command == ControlCommand::Restart {
            self.restart_requested = true;
        }
        self.shutdown.trigger();
        Some(command)
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    /// Handle that interrupts blocking calls from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn info(&self) -> AgentInfo {
        let subscriptions = if self.state.is_connected() {
            self.subscriptions.clone()
        } else {
            self.initial_subscriptions()
        };

        AgentInfo {
            name: self.name.clone(),
            id: self.id.clone(),
            settings_uri: self.settings.uri().to_string(),
            broker_url: self.settings.broker().broker_url.clone(),
            pub_topic: self.pub_topic().to_string(),
            subscriptions,
            crypto_enabled: self.crypto_enabled,
            state: self.state,
        }
    }

    // Errors

    /// Description of the most recent failure
    pub fn last_error(&self) -> Option<&str> {
        self.connection
            .last_error()
            .map(|error| error.description.as_str())
    }

    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.connection.last_error().map(|error| error.kind)
    }
}

impl<T: Transport> Drop for Agent<T> {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
