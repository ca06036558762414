//! Settings Store
//!
//! Holds the agent's settings mapping. The mapping comes either from the
//! agent's table in a local TOML file or from a settings document fetched
//! over the broker connection. A failed fetch never touches the cached copy.

use crate::agent::connection::ConnectionManager;
use crate::config::{
    BrokerConfig, ConfigError, LocalSettings, SettingsSource, DEFAULT_SETTINGS_TIMEOUT,
};
use crate::error::{AgentError, AgentResult};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings mapping of one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(Map<String, Value>);

impl Settings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Topics listed under `sub_topic`, either a single string or an array
    pub fn sub_topics(&self) -> Vec<String> {
        match self.get("sub_topic") {
            Some(Value::String(topic)) => vec![topic.clone()],
            Some(Value::Array(topics)) => topics
                .iter()
                .filter_map(|topic| topic.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Main loop period from `time_step` in milliseconds; zero when unset
    pub fn time_step(&self) -> Duration {
        self.get("time_step")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO)
    }

    pub fn pub_topic(&self) -> Option<&str> {
        self.get_str("pub_topic").filter(|topic| !topic.is_empty())
    }

    /// JSON rendering; `indent == 0` gives a single line
    pub fn format(&self, indent: usize) -> String {
        if indent == 0 {
            return serde_json::to_string(&self.0).unwrap_or_default();
        }

        let indent = " ".repeat(indent);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
        let mut buffer = Vec::new();
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        if self.0.serialize(&mut serializer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl From<Map<String, Value>> for Settings {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(0))
    }
}

/// Settings Store: cached settings plus where they come from
#[derive(Debug, Clone)]
pub struct SettingsStore {
    uri: String,
    source: SettingsSource,
    cache: Settings,
    broker: BrokerConfig,
    timeout: Duration,
    fetched_from_broker: bool,
}

impl SettingsStore {
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let source = SettingsSource::resolve(&uri);
        let broker = match &source {
            SettingsSource::Broker(url) => BrokerConfig::for_url(url.clone()),
            SettingsSource::Local(_) => BrokerConfig::default(),
        };

        Self {
            uri,
            source,
            cache: Settings::default(),
            broker,
            timeout: DEFAULT_SETTINGS_TIMEOUT,
            fetched_from_broker: false,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn source(&self) -> &SettingsSource {
        &self.source
    }

    /// Broker options used to connect
    pub fn broker(&self) -> &BrokerConfig {
        &self.broker
    }

    pub fn settings(&self) -> &Settings {
        &self.cache
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn fetched_from_broker(&self) -> bool {
        self.fetched_from_broker
    }

    /// Read `[agents]` and the agent's table from the local settings file
    ///
    /// No-op for broker-sourced settings.
    pub fn load_local(&mut self, agent_name: &str) -> Result<(), ConfigError> {
        let SettingsSource::Local(path) = &self.source else {
            return Ok(());
        };

        let local = LocalSettings::load(path, agent_name)?;
        debug!(
            path = %path.display(),
            keys = local.section.len(),
            broker = %local.broker.broker_url,
            "Local settings loaded"
        );
        self.broker = local.broker;
        self.cache = Settings::from(local.section);
        self.fetched_from_broker = false;
        Ok(())
    }

    /// Replace the cache with a settings document received from the broker
    pub fn apply_document(&mut self, document: Value) -> AgentResult<()> {
        match document {
            Value::Object(map) => {
                self.cache = Settings::from(map);
                self.fetched_from_broker = true;
                Ok(())
            }
            other => Err(AgentError::decoding(format!(
                "settings document must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Refresh the cache from the settings source
    ///
    /// A broker request that gets no reply within `timeout` fails with
    /// `SettingsTimeout` and keeps the previous cache.
    pub async fn fetch<T: Transport>(
        &mut self,
        connection: &mut ConnectionManager<T>,
        agent_name: &str,
        timeout: Duration,
    ) -> AgentResult<()> {
        if self.source.is_local() {
            return Ok(self.load_local(agent_name)?);
        }

        match connection.request_settings(agent_name, timeout).await? {
            Some(document) => {
                self.apply_document(document)?;
                info!(agent = agent_name, keys = self.cache.len(), "Settings fetched from broker");
                Ok(())
            }
            None => {
                warn!(
                    agent = agent_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "No settings reply from broker, keeping cached settings"
                );
                Err(AgentError::settings_timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Write broker-fetched settings as a local settings file
    pub fn save(&self, path: &Path, agent_name: &str) -> AgentResult<()> {
        if !self.fetched_from_broker {
            return Err(ConfigError::InvalidConfig(
                "only settings fetched from the broker can be saved".to_string(),
            )
            .into());
        }

        let mut document = toml::Table::new();
        document.insert(
            "agents".to_string(),
            toml::Value::try_from(&self.broker).map_err(|e| AgentError::encoding(e.to_string()))?,
        );
        document.insert(
            agent_name.to_string(),
            toml::Value::try_from(self.cache.as_map())
                .map_err(|e| AgentError::encoding(e.to_string()))?,
        );

        let content = toml::to_string(&document).map_err(|e| AgentError::encoding(e.to_string()))?;
        std::fs::write(path, content).map_err(ConfigError::from)?;
        info!(path = %path.display(), "Settings saved");
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
