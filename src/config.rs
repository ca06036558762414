//! Configuration for the messaging agent
//!
//! Compiled-in defaults, settings-source resolution, the local TOML settings
//! file format and the broker/crypto sections consumed when connecting.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Settings URI used when the caller does not provide one
pub const DEFAULT_SETTINGS_URI: &str = "mqtt://localhost:1883";

/// Broker used when a local settings file does not name one
pub const DEFAULT_BROKER_URL: &str = "mqtt://localhost:1883";

pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_SETTINGS_TIMEOUT: Duration = Duration::from_millis(2000);

/// Executable prefix stripped from agent names
const NAME_PREFIX: &str = "mads-";

/// Library version reported in event frames
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Compiled-in default settings URI
pub fn default_settings_uri() -> &'static str {
    DEFAULT_SETTINGS_URI
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid settings file: missing '{0}' section")]
    MissingSection(String),
    #[error("Invalid agent identity: {0}")]
    InvalidIdentity(String),
    #[error("Missing key material: {}", .0.display())]
    MissingKeyMaterial(PathBuf),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Where an agent's settings come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsSource {
    /// Local TOML settings file
    Local(PathBuf),
    /// Settings fetched from the broker at this URL
    Broker(String),
}

impl SettingsSource {
    const BROKER_SCHEMES: [&'static str; 4] = ["mqtt", "mqtts", "tcp", "ssl"];

    /// Broker URIs are recognised by scheme, everything else is a file path
    pub fn resolve(uri: &str) -> Self {
        let is_broker = uri
            .split_once("://")
            .map(|(scheme, _)| {
                Self::BROKER_SCHEMES
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(scheme))
            })
            .unwrap_or(false);

        if is_broker {
            SettingsSource::Broker(uri.to_string())
        } else {
            SettingsSource::Local(PathBuf::from(uri))
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SettingsSource::Local(_))
    }
}

/// Broker connection section (`[agents]` in a local settings file)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Broker URL with scheme and port
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            broker_url: url.into(),
            ..Default::default()
        }
    }

    pub fn username(&self) -> Option<String> {
        self.username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Contents of a local settings file, resolved for one agent
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSettings {
    pub broker: BrokerConfig,
    pub section: Map<String, Value>,
}

impl LocalSettings {
    /// Load `[agents]` and `[<agent_name>]` from a TOML settings file
    pub fn load(path: &Path, agent_name: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, agent_name)
    }

    pub fn parse(content: &str, agent_name: &str) -> Result<Self, ConfigError> {
        let mut table: toml::Table = toml::from_str(content)?;

        let broker = match table.remove("agents") {
            Some(agents) => agents.try_into::<BrokerConfig>()?,
            None => BrokerConfig::default(),
        };

        let section = match table.remove(agent_name) {
            Some(toml::Value::Table(section)) => section,
            _ => return Err(ConfigError::MissingSection(agent_name.to_string())),
        };

        let section = match serde_json::to_value(section) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(ConfigError::MissingSection(agent_name.to_string())),
            Err(e) => return Err(ConfigError::InvalidConfig(e.to_string())),
        };

        Ok(Self { broker, section })
    }
}

/// Certificate material used for TLS client authentication
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// CA certificate identifying the broker
    pub server_certificate: Vec<u8>,
    pub client_certificate: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("server_certificate", &self.server_certificate.len())
            .field("client_certificate", &self.client_certificate.len())
            .field("client_key", &"***")
            .finish()
    }
}

/// Crypto configuration; must be settled before connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoConfig {
    pub key_dir: PathBuf,
    pub client_key_name: String,
    pub server_key_name: String,
    pub auth_verbose: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("etc"),
            client_key_name: "client".to_string(),
            server_key_name: "broker".to_string(),
            auth_verbose: false,
        }
    }
}

impl CryptoConfig {
    pub fn server_certificate_path(&self) -> PathBuf {
        self.key_dir.join(format!("{}.crt", self.server_key_name))
    }

    pub fn client_certificate_path(&self) -> PathBuf {
        self.key_dir.join(format!("{}.crt", self.client_key_name))
    }

    pub fn client_key_path(&self) -> PathBuf {
        self.key_dir.join(format!("{}.key", self.client_key_name))
    }

    /// Read the broker certificate and the client certificate/key pair
    pub fn load_key_material(&self) -> Result<KeyMaterial, ConfigError> {
        Ok(KeyMaterial {
            server_certificate: read_key_file(&self.server_certificate_path())?,
            client_certificate: read_key_file(&self.client_certificate_path())?,
            client_key: read_key_file(&self.client_key_path())?,
        })
    }
}

fn read_key_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::MissingKeyMaterial(path.to_path_buf()));
    }
    Ok(std::fs::read(path)?)
}

/// Strip leading directories and the executable prefix from an agent name
pub fn normalize_agent_name(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(name);
    base.strip_prefix(NAME_PREFIX).unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_settings_source_resolution() {
        assert_eq!(
            SettingsSource::resolve("mqtt://localhost:1883"),
            SettingsSource::Broker("mqtt://localhost:1883".to_string())
        );
        assert_eq!(
            SettingsSource::resolve("tcp://10.0.0.2:9092"),
            SettingsSource::Broker("tcp://10.0.0.2:9092".to_string())
        );
        assert_eq!(
            SettingsSource::resolve("MQTTS://broker:8883"),
            SettingsSource::Broker("MQTTS://broker:8883".to_string())
        );
        assert_eq!(
            SettingsSource::resolve("mads.toml"),
            SettingsSource::Local(PathBuf::from("mads.toml"))
        );
        assert!(SettingsSource::resolve("file://mads.toml").is_local());
    }

    #[test]
    fn test_normalize_agent_name() {
        assert_eq!(normalize_agent_name("feedback"), "feedback");
        assert_eq!(normalize_agent_name("/usr/local/bin/mads-feedback"), "feedback");
        assert_eq!(normalize_agent_name("mads-bridge"), "bridge");
        assert_eq!(normalize_agent_name("C:\\mads\\bin\\logger"), "logger");
        assert_eq!(normalize_agent_name("data-logger"), "data-logger");
    }

    #[test]
    fn test_parse_local_settings() {
        let content = r#"
[agents]
broker_url = "mqtt://broker.local:1884"
username_env = "MADS_USER"

[feedback]
sub_topic = ["bridge", "logger"]
print_width = 65
enabled = true
"#;
        let settings = LocalSettings::parse(content, "feedback").unwrap();

        assert_eq!(settings.broker.broker_url, "mqtt://broker.local:1884");
        assert_eq!(settings.broker.username_env, Some("MADS_USER".to_string()));
        assert_eq!(settings.broker.keep_alive_secs, 60);
        assert_eq!(settings.section["print_width"], serde_json::json!(65));
        assert_eq!(settings.section["enabled"], serde_json::json!(true));
        assert_eq!(
            settings.section["sub_topic"],
            serde_json::json!(["bridge", "logger"])
        );
    }

    #[test]
    fn test_parse_local_settings_without_agents_section() {
        let settings = LocalSettings::parse("[bridge]\npub_topic = \"bridge\"\n", "bridge").unwrap();
        assert_eq!(settings.broker, BrokerConfig::default());
    }

    #[test]
    fn test_parse_local_settings_missing_section() {
        let result = LocalSettings::parse("[other]\nx = 1\n", "feedback");
        assert!(matches!(result, Err(ConfigError::MissingSection(name)) if name == "feedback"));
    }

    #[test]
    fn test_parse_local_settings_section_must_be_table() {
        let result = LocalSettings::parse("feedback = 3\n", "feedback");
        assert!(matches!(result, Err(ConfigError::MissingSection(_))));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = LocalSettings::parse("[feedback\n", "feedback");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_load_local_settings_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logger]\nformat = \"json\"").unwrap();

        let settings = LocalSettings::load(file.path(), "logger").unwrap();
        assert_eq!(settings.section["format"], serde_json::json!("json"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = LocalSettings::load(Path::new("/nonexistent/mads.toml"), "logger");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_crypto_defaults_and_paths() {
        let crypto = CryptoConfig::default();
        assert_eq!(crypto.server_certificate_path(), PathBuf::from("etc/broker.crt"));
        assert_eq!(crypto.client_certificate_path(), PathBuf::from("etc/client.crt"));
        assert_eq!(crypto.client_key_path(), PathBuf::from("etc/client.key"));
        assert!(!crypto.auth_verbose);
    }

    #[test]
    fn test_load_key_material() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broker.crt"), b"ca").unwrap();
        std::fs::write(dir.path().join("client.crt"), b"cert").unwrap();
        std::fs::write(dir.path().join("client.key"), b"key").unwrap();

        let crypto = CryptoConfig {
            key_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let material = crypto.load_key_material().unwrap();
        assert_eq!(material.server_certificate, b"ca");
        assert_eq!(material.client_certificate, b"cert");
        assert_eq!(material.client_key, b"key");
        assert!(!format!("{material:?}").contains("key\""));
    }

    #[test]
    fn test_load_key_material_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = CryptoConfig {
            key_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let result = crypto.load_key_material();
        assert!(matches!(result, Err(ConfigError::MissingKeyMaterial(path)) if path.ends_with("broker.crt")));
    }

    #[test]
    fn test_broker_config_credentials_from_env() {
        std::env::set_var("MADS_TEST_BROKER_USER", "alice");
        let broker = BrokerConfig {
            username_env: Some("MADS_TEST_BROKER_USER".to_string()),
            password_env: Some("MADS_TEST_BROKER_PASSWORD_UNSET".to_string()),
            ..Default::default()
        };
        assert_eq!(broker.username(), Some("alice".to_string()));
        assert_eq!(broker.password(), None);
        assert_eq!(broker.keep_alive(), Duration::from_secs(60));
    }
}
