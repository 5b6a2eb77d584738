//! Configuration Module
//!
//! Provides TOML-based configuration for Fieldlink with support for:
//! - Gateway identity (gateway id, farm id, NTP server handed to devices)
//! - Broker connection settings
//! - Liveness probing and telemetry buffering
//! - WebSocket server settings
//! - Environment variable overrides (FIELDLINK__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use mqtt::MqttConfig;
pub use persistence::PersistenceConfig;

mod mqtt;
mod persistence;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Gateway identity
    pub gateway: GatewayConfig,
    /// Broker connection
    pub mqtt: MqttConfig,
    /// Liveness probing
    pub liveness: LivenessConfig,
    /// Telemetry buffering
    pub telemetry: TelemetryConfig,
    /// WebSocket server configuration
    pub server: ServerConfig,
    /// History storage
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Gateway identity, reported to devices in pings and discovery replies
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Identifier of this gateway
    #[serde(default = "default_gateway_id")]
    pub id: String,
    /// Farm the gateway belongs to
    #[serde(default = "default_farm_id")]
    pub farm_id: String,
    /// Time server devices are told to use
    #[serde(default = "default_ntp_server")]
    pub ntp_server: String,
}

fn default_gateway_id() -> String {
    "gateway-001".to_string()
}

fn default_farm_id() -> String {
    "farm-001".to_string()
}

fn default_ntp_server() -> String {
    "gateway.local".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            id: default_gateway_id(),
            farm_id: default_farm_id(),
            ntp_server: default_ntp_server(),
        }
    }
}

fn default_liveness_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_liveness_grace() -> Duration {
    Duration::from_secs(10)
}

/// Liveness probing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Run the periodic sweep
    pub enabled: bool,

    /// Time between sweeps (e.g., "60s")
    #[serde(default = "default_liveness_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How long devices get to answer a ping (e.g., "10s")
    #[serde(default = "default_liveness_grace", with = "humantime_serde")]
    pub grace: Duration,

    /// Extra age a status may have, measured back from the ping, before it
    /// counts as stale
    #[serde(default, with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_liveness_interval(),
            grace: default_liveness_grace(),
            stale_after: Duration::ZERO,
        }
    }
}

/// Telemetry buffering
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Samples kept in memory per device
    pub buffer_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

/// WebSocket server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket bind address
    #[serde(default = "default_ws_bind")]
    pub ws_bind: SocketAddr,
    /// Path prefix for the streaming endpoints
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Silence after which the server pings a client (e.g., "30s")
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Frames queued per client before sends count as failed
    pub outbound_channel_capacity: usize,
}

fn default_ws_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_ws_path() -> String {
    "/api/v1/ws".to_string()
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_bind: default_ws_bind(),
            ws_path: default_ws_path(),
            idle_timeout: default_idle_timeout(),
            outbound_channel_capacity: 256,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `FIELDLINK__` prefix with double underscores for nesting:
    ///    - `FIELDLINK__MQTT__ADDRESS=broker:1883` overrides `mqtt.address`
    ///    - `FIELDLINK__GATEWAY__ID=gw-7` overrides `gateway.id`
    ///    - `FIELDLINK__LIVENESS__ENABLED=false` overrides `liveness.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("gateway.id", "gateway-001")?
            .set_default("gateway.farm_id", "farm-001")?
            .set_default("gateway.ntp_server", "gateway.local")?
            .set_default("mqtt.address", "localhost:1883")?
            .set_default("mqtt.keepalive", 60)?
            .set_default("mqtt.clean_session", true)?
            .set_default("mqtt.qos", 1)?
            .set_default("mqtt.reconnect_interval", 1)?
            .set_default("mqtt.max_reconnect_interval", 120)?
            .set_default("mqtt.queue_capacity", 1024)?
            .set_default("mqtt.request_capacity", 100)?
            .set_default("liveness.enabled", true)?
            .set_default("liveness.interval", "60s")?
            .set_default("liveness.grace", "10s")?
            .set_default("liveness.stale_after", "0s")?
            .set_default("telemetry.buffer_size", 1000)?
            .set_default("server.ws_bind", "0.0.0.0:8000")?
            .set_default("server.ws_path", "/api/v1/ws")?
            .set_default("server.idle_timeout", "30s")?
            .set_default("server.outbound_channel_capacity", 256)?
            .set_default("persistence.enabled", true)?
            .set_default("persistence.path", "./data")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("FIELDLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides and validate the result again
    pub fn apply_overrides(
        &mut self,
        ws_bind: Option<SocketAddr>,
        broker: Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(ws_bind) = ws_bind {
            self.server.ws_bind = ws_bind;
        }
        if let Some(broker) = broker {
            self.mqtt.address = broker;
        }
        self.validate()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.id.is_empty() {
            return Err(ConfigError::Validation(
                "gateway.id must not be empty".to_string(),
            ));
        }

        if self.mqtt.parse_address().0.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.address must name a host".to_string(),
            ));
        }

        if self.mqtt.qos > 2 {
            return Err(ConfigError::Validation(
                "mqtt.qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.mqtt.keepalive < 5 {
            return Err(ConfigError::Validation(
                "mqtt.keepalive must be at least 5 seconds".to_string(),
            ));
        }

        if self.mqtt.reconnect_interval == 0 {
            return Err(ConfigError::Validation(
                "mqtt.reconnect_interval must be at least 1".to_string(),
            ));
        }

        if self.mqtt.reconnect_interval > self.mqtt.max_reconnect_interval {
            return Err(ConfigError::Validation(
                "mqtt.reconnect_interval must not exceed mqtt.max_reconnect_interval".to_string(),
            ));
        }

        if self.mqtt.queue_capacity == 0 || self.mqtt.request_capacity == 0 {
            return Err(ConfigError::Validation(
                "mqtt queue capacities must be at least 1".to_string(),
            ));
        }

        if self.telemetry.buffer_size == 0 {
            return Err(ConfigError::Validation(
                "telemetry.buffer_size must be at least 1".to_string(),
            ));
        }

        if self.server.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "server.outbound_channel_capacity must be at least 1".to_string(),
            ));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "server.ws_path must start with '/'".to_string(),
            ));
        }

        if self.liveness.enabled && self.liveness.interval.is_zero() {
            return Err(ConfigError::Validation(
                "liveness.interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
