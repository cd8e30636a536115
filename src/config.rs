//! TOML configuration for the edge agent and the backend ingestor.
//!
//! Files live under `~/.config/suctionsense/` unless a path is given on the
//! command line. A missing file degrades to defaults with a warning so a
//! fresh device still boots; a file that exists but does not parse or
//! validate is an error.

use crate::backend::router::AbsentFieldPolicy;
use crate::edge::debounce::{DebounceConfig, DebounceError};
use crate::edge::source::{Pull, SourceConfig};
use crate::messages::{self, DEFAULT_TOPIC_PREFIX, MOTION_FIELD, SUCTION_FIELD};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "suctionsense";
const EDGE_CONFIG_FILE: &str = "edge.toml";
const BACKEND_CONFIG_FILE: &str = "backend.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid debounce settings for channel '{field}': {source}")]
    Debounce {
        field: String,
        source: DebounceError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    /// 0, 1 or 2
    pub qos: u8,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 30,
            connect_timeout_ms: 3000,
            qos: 1,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker host is empty".to_string()));
        }
        if self.qos > 2 {
            return Err(ConfigError::Invalid(format!("broker qos {} is not 0, 1 or 2", self.qos)));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Establishment attempts at startup before reporting failure
    pub startup_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound on network servicing per loop iteration
    pub service_window_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_attempts: 10,
            backoff_initial_ms: 500,
            backoff_max_ms: 10_000,
            service_window_ms: 20,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct LinkConfig {
    /// Interface whose operstate gates the link, e.g. "wlan0"
    pub interface: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    /// Payload field this channel drives, e.g. "suction_on"
    pub field: String,
    pub source: SourceConfig,
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub report_distance: bool,
    #[serde(default)]
    pub initial_state: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EdgeConfig {
    pub device_id: String,
    pub room: String,
    pub topic_prefix: String,
    pub sample_interval_ms: u64,
    pub link: LinkConfig,
    pub broker: BrokerConfig,
    pub supervisor: SupervisorConfig,
    pub channels: Vec<ChannelConfig>,
}

impl Default for EdgeConfig {
    /// Flow switch on GPIO 12 (active low) and PIR on GPIO 5 with a five
    /// second dwell, the combined suction + motion board.
    fn default() -> Self {
        Self {
            device_id: "esp32_dev1".to_string(),
            room: "OR-DEV".to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            sample_interval_ms: 100,
            link: LinkConfig::default(),
            broker: BrokerConfig::default(),
            supervisor: SupervisorConfig::default(),
            channels: vec![
                ChannelConfig {
                    field: SUCTION_FIELD.to_string(),
                    source: SourceConfig::Gpio {
                        pin: 12,
                        pull: Pull::Up,
                        active_low: true,
                    },
                    debounce: DebounceConfig::Dwell { stable_ms: 0 },
                    report_distance: false,
                    initial_state: false,
                },
                ChannelConfig {
                    field: MOTION_FIELD.to_string(),
                    source: SourceConfig::Gpio {
                        pin: 5,
                        pull: Pull::Down,
                        active_low: false,
                    },
                    debounce: DebounceConfig::Dwell { stable_ms: 5000 },
                    report_distance: false,
                    initial_state: false,
                },
            ],
        }
    }
}

impl EdgeConfig {
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = load_or_default(path, EDGE_CONFIG_FILE).await?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        for (name, value) in [
            ("device_id", &self.device_id),
            ("room", &self.room),
            ("topic_prefix", &self.topic_prefix),
        ] {
            if value.trim().is_empty() || value.contains(['/', '+', '#']) {
                return Err(ConfigError::Invalid(format!(
                    "{} '{}' must be a non-empty topic segment",
                    name, value
                )));
            }
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid("sample_interval_ms must be positive".to_string()));
        }
        if self.supervisor.startup_attempts == 0 {
            return Err(ConfigError::Invalid("startup_attempts must be at least 1".to_string()));
        }
        if self.supervisor.backoff_max_ms < self.supervisor.backoff_initial_ms {
            return Err(ConfigError::Invalid(
                "backoff_max_ms is smaller than backoff_initial_ms".to_string(),
            ));
        }
        if self.channels.is_empty() {
            return Err(ConfigError::Invalid("at least one channel is required".to_string()));
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.field.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "channel field '{}' is configured twice",
                    channel.field
                )));
            }
            channel
                .debounce
                .validate()
                .map_err(|source| ConfigError::Debounce {
                    field: channel.field.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn state_topic(&self) -> String {
        messages::state_topic(&self.topic_prefix, &self.room)
    }

    pub fn status_topic(&self) -> String {
        messages::status_topic(&self.topic_prefix, &self.device_id)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; the store is kept in memory when unset
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub client_id: String,
    pub topic_prefix: String,
    pub reconnect_delay_ms: u64,
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub absent_fields: AbsentFieldPolicy,
    /// Rooms provisioned at startup, before any device reports
    pub seed_rooms: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            client_id: "suction-ingestor".to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            reconnect_delay_ms: 1000,
            broker: BrokerConfig::default(),
            database: DatabaseConfig::default(),
            absent_fields: AbsentFieldPolicy::default(),
            seed_rooms: Vec::new(),
        }
    }
}

impl BackendConfig {
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = load_or_default(path, BACKEND_CONFIG_FILE).await?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("client_id is empty".to_string()));
        }
        if self.topic_prefix.trim().is_empty() || self.topic_prefix.contains(['+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "topic_prefix '{}' is not a valid prefix",
                self.topic_prefix
            )));
        }
        Ok(())
    }

    pub fn topic_filter(&self) -> String {
        messages::state_filter(&self.topic_prefix)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.max(100))
    }
}

pub fn default_config_path(file: &str) -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path.push(file);
    path
}

async fn load_or_default<T>(path: Option<&Path>, file: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    let path = path.map(Path::to_path_buf).unwrap_or_else(|| default_config_path(file));

    let exists = tokio::fs::try_exists(&path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
    if !exists {
        warn!("Config file {} does not exist, using defaults", path.display());
        return Ok(T::default());
    }

    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
    debug!("Read {} bytes from {}", content.len(), path.display());

    let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
