//! Connection Manager
//!
//! Owns the agent's transport handle, bounds blocking receives with the
//! receive timeout, holds the crypto configuration and remembers the last
//! failure. A [`ShutdownHandle`] interrupts a pending receive or connect delay
//! from another task.

use crate::config::{ConfigError, CryptoConfig, KeyMaterial, DEFAULT_RECEIVE_TIMEOUT};
use crate::error::{AgentError, AgentResult, ErrorKind};
use crate::protocol::Envelope;
use crate::transport::{ConnectOptions, Transport};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Cloneable signal that stops blocking agent operations
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal; it stays raised
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is raised
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once raised
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Most recent failure recorded by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: ErrorKind,
    pub description: String,
}

/// Connection Manager owning one transport
pub struct ConnectionManager<T: Transport> {
    transport: Option<T>,
    receive_timeout: Duration,
    crypto: CryptoConfig,
    key_material: Option<KeyMaterial>,
    material_stale: bool,
    last_error: Option<LastError>,
    shutdown: ShutdownHandle,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, shutdown: ShutdownHandle) -> Self {
        Self {
            transport: Some(transport),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            crypto: CryptoConfig::default(),
            key_material: None,
            material_stale: true,
            last_error: None,
            shutdown,
        }
    }

    fn transport_mut(&mut self) -> AgentResult<&mut T> {
        self.transport
            .as_mut()
            .ok_or_else(|| AgentError::allocation("transport has been released"))
    }

    fn transport_ref(&self) -> AgentResult<&T> {
        self.transport
            .as_ref()
            .ok_or_else(|| AgentError::allocation("transport has been released"))
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }

    pub fn crypto(&self) -> &CryptoConfig {
        &self.crypto
    }

    pub fn set_key_dir(&mut self, key_dir: impl Into<PathBuf>) {
        self.crypto.key_dir = key_dir.into();
        self.material_stale = true;
    }

    pub fn set_client_key_name(&mut self, name: impl Into<String>) {
        self.crypto.client_key_name = name.into();
        self.material_stale = true;
    }

    pub fn set_server_key_name(&mut self, name: impl Into<String>) {
        self.crypto.server_key_name = name.into();
        self.material_stale = true;
    }

    pub fn set_auth_verbose(&mut self, verbose: bool) {
        self.crypto.auth_verbose = verbose;
    }

    /// Read key material from the configured directory
    pub fn load_key_material(&mut self) -> Result<(), ConfigError> {
        let material = self.crypto.load_key_material()?;
        debug!(
            key_dir = %self.crypto.key_dir.display(),
            client = %self.crypto.client_key_name,
            server = %self.crypto.server_key_name,
            "Key material loaded"
        );
        self.key_material = Some(material);
        self.material_stale = false;
        Ok(())
    }

    /// Key material for a connection attempt, reloaded if the crypto settings changed
    pub fn key_material(&mut self) -> Result<KeyMaterial, ConfigError> {
        if self.material_stale || self.key_material.is_none() {
            self.load_key_material()?;
        }
        self.key_material
            .clone()
            .ok_or_else(|| ConfigError::MissingKeyMaterial(self.crypto.client_key_path()))
    }

    /// Open the transport after an optional pause
    ///
    /// The pause is cut short by the shutdown handle, in which case no
    /// connection is attempted.
    pub async fn connect(&mut self, options: &ConnectOptions, delay: Duration) -> AgentResult<()> {
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Delaying connection attempt");
            let shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => {
                    return Err(AgentError::connection_msg("connect interrupted by shutdown"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let transport = self.transport_mut()?;
        transport
            .connect(options)
            .await
            .map_err(AgentError::connection)?;
        info!(client_id = %options.client_id, broker = %options.broker.broker_url, "Connected to broker");
        Ok(())
    }

    /// Close the transport; failures are logged, never returned
    pub async fn disconnect(&mut self) {
        let Ok(transport) = self.transport_mut() else {
            return;
        };
        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "Transport disconnect failed");
        }
    }

    pub async fn subscribe(&mut self, topic: &str) -> AgentResult<()> {
        self.transport_mut()?
            .subscribe(topic)
            .await
            .map_err(AgentError::connection)
    }

    pub async fn send(&self, envelope: &Envelope) -> AgentResult<()> {
        self.transport_ref()?
            .send(envelope)
            .await
            .map_err(AgentError::connection)
    }

    /// Next envelope, or `None` when nothing arrives in time
    ///
    /// With `dont_block` only an already pending envelope is returned. Otherwise
    /// waits up to the receive timeout, or until the shutdown handle is raised.
    pub async fn receive(&mut self, dont_block: bool) -> AgentResult<Option<Envelope>> {
        if dont_block {
            return self
                .transport_mut()?
                .try_receive()
                .map_err(AgentError::connection);
        }

        if self.shutdown.is_triggered() {
            return Ok(None);
        }

        let timeout = self.receive_timeout;
        let shutdown = self.shutdown.clone();
        let transport = self.transport_mut()?;

        tokio::select! {
            _ = shutdown.triggered() => {
                debug!("Receive interrupted by shutdown");
                Ok(None)
            }
            result = tokio::time::timeout(timeout, transport.receive()) => match result {
                Ok(Ok(envelope)) => Ok(Some(envelope)),
                Ok(Err(e)) => Err(AgentError::connection(e)),
                Err(_) => Ok(None),
            }
        }
    }

    pub async fn request_settings(
        &mut self,
        agent_name: &str,
        timeout: Duration,
    ) -> AgentResult<Option<Value>> {
        self.transport_mut()?
            .request_settings(agent_name, timeout)
            .await
            .map_err(AgentError::connection)
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .map(|transport| transport.is_connected())
            .unwrap_or(false)
    }

    /// Drop the transport; later operations fail with an allocation error
    pub fn release(&mut self) {
        if self.transport.take().is_some() {
            debug!("Transport released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.transport.is_none()
    }

    pub fn record_error(&mut self, error: &AgentError) {
        let description = error.description();
        warn!(kind = ?error.kind(), code = error.code(), "{}", description);
        self.last_error = Some(LastError {
            kind: error.kind(),
            description,
        });
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }
}
