//! # Configuration
//!
//! Settings for both endpoints, grouped by concern:
//!
//! ```toml
//! [server]      # listen address, handshake/shutdown timeouts, limits, duplicate keys
//! [client]      # server address, connection key, connect and reply timeouts
//! [transport]   # frame size limit, write timeout
//! [logging]     # level and output format
//! ```
//!
//! Durations are written as integer milliseconds. Every section may be
//! omitted and falls back to its defaults.
//!
//! ## Sources
//! - TOML via [`NetworkConfig::from_file`] / [`NetworkConfig::from_toml`]
//! - `FASTSOCKET_*` environment variables via [`NetworkConfig::from_env`]
//! - Code, starting from `Default` or [`NetworkConfig::default_with_overrides`]

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Frame format version written into every frame header
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes opening every frame ("FSKT")
pub const MAGIC_BYTES: [u8; 4] = [0x46, 0x53, 0x4B, 0x54];

/// Largest accepted frame payload (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Message code whose handlers run for every inbound message
pub const WILDCARD_CODE: &str = "ALL";

const ENV_PREFIX: &str = "FASTSOCKET_";

/// Complete endpoint configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Read a TOML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Parse TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid TOML configuration: {e}")))
    }

    /// Defaults overridden by `FASTSOCKET_*` environment variables.
    ///
    /// | Variable | Setting |
    /// |---|---|
    /// | `FASTSOCKET_SERVER_ADDRESS` | `server.address` |
    /// | `FASTSOCKET_CLIENT_ADDRESS` | `client.address` |
    /// | `FASTSOCKET_CONNECTION_KEY` | `client.connection_key` |
    /// | `FASTSOCKET_MAX_CONNECTIONS` | `server.max_connections` |
    /// | `FASTSOCKET_CONNECTION_TIMEOUT_MS` | both endpoints' `connection_timeout` |
    /// | `FASTSOCKET_RESPONSE_TIMEOUT_MS` | `client.response_timeout` |
    /// | `FASTSOCKET_DUPLICATE_KEY_POLICY` | `server.duplicate_key_policy` |
    /// | `FASTSOCKET_LOG_LEVEL` | `logging.log_level` |
    ///
    /// A variable that is set but cannot be parsed is an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(address) = env_value::<String>("SERVER_ADDRESS")? {
            config.server.address = address;
        }
        if let Some(address) = env_value::<String>("CLIENT_ADDRESS")? {
            config.client.address = address;
        }
        if let Some(key) = env_value::<String>("CONNECTION_KEY")? {
            config.client.connection_key = Some(key);
        }
        if let Some(max) = env_value::<usize>("MAX_CONNECTIONS")? {
            config.server.max_connections = max;
        }
        if let Some(ms) = env_value::<u64>("CONNECTION_TIMEOUT_MS")? {
            config.server.connection_timeout = Duration::from_millis(ms);
            config.client.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("RESPONSE_TIMEOUT_MS")? {
            config.client.response_timeout = Duration::from_millis(ms);
        }
        if let Some(policy) = env_value::<DuplicateKeyPolicy>("DUPLICATE_KEY_POLICY")? {
            config.server.duplicate_key_policy = policy;
        }
        if let Some(level) = env_value::<Level>("LOG_LEVEL")? {
            config.logging.log_level = level;
        }

        Ok(config)
    }

    /// Defaults with `mutator` applied
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The default configuration rendered as TOML
    pub fn example_config() -> Result<String> {
        Self::default().to_toml()
    }

    /// This configuration rendered as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Cannot render configuration: {e}")))
    }

    /// Write this configuration as TOML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = self.to_toml()?;
        std::fs::write(path, text).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot write {}: {e}", path.display()))
        })
    }

    /// Every problem found in the configuration; empty when it is usable
    pub fn validate(&self) -> Vec<String> {
        [
            self.server.validate(),
            self.client.validate(),
            self.transport.validate(),
            self.logging.validate(),
        ]
        .concat()
    }

    /// Like [`validate`](Self::validate), folding problems into one error
    pub fn validate_strict(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            problems.join("\n  - ")
        )))
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>> {
    let var = format!("{ENV_PREFIX}{name}");
    match std::env::var(&var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("{var} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

fn check_socket_addr(problems: &mut Vec<String>, role: &str, address: &str) {
    if address.is_empty() {
        problems.push(format!("{role} address cannot be empty"));
    } else if address.parse::<SocketAddr>().is_err() {
        problems.push(format!(
            "Invalid {} address '{address}' (expected ip:port)",
            role.to_lowercase()
        ));
    }
}

/// What the server does when a connection announces a key that is already live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKeyPolicy {
    /// Register the new connection and close the one it supersedes
    #[default]
    ReplaceExisting,
    /// Refuse the new connection during its handshake
    Reject,
}

impl FromStr for DuplicateKeyPolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "replace_existing" | "replace" => Ok(Self::ReplaceExisting),
            "reject" => Ok(Self::Reject),
            other => Err(ProtocolError::ConfigError(format!(
                "Unknown duplicate key policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address, `ip:port`; port 0 picks a free port
    pub address: String,

    /// Time a new connection has to complete its handshake
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    /// How long `stop` waits for connections to wind down
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,

    /// Upper bound on registered connections
    pub max_connections: usize,

    #[serde(default)]
    pub duplicate_key_policy: DuplicateKeyPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8765".into(),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            max_connections: 1000,
            duplicate_key_policy: DuplicateKeyPolicy::ReplaceExisting,
        }
    }
}

impl ServerConfig {
    /// Defaults listening on `address`
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        check_socket_addr(&mut problems, "Server", &self.address);

        match self.connection_timeout {
            t if t < Duration::from_millis(100) => {
                problems.push("Connection timeout too short (minimum: 100ms)".into())
            }
            t if t > Duration::from_secs(300) => {
                problems.push("Connection timeout too long (maximum: 300s)".into())
            }
            _ => {}
        }

        match self.shutdown_timeout {
            t if t < Duration::from_secs(1) => {
                problems.push("Shutdown timeout too short (minimum: 1s)".into())
            }
            t if t > Duration::from_secs(60) => {
                problems.push("Shutdown timeout too long (maximum: 60s)".into())
            }
            _ => {}
        }

        match self.max_connections {
            0 => problems.push("Max connections must be greater than 0".into()),
            n if n > 100_000 => problems.push(format!(
                "Max connections very high: {n} (check file descriptor limits)"
            )),
            _ => {}
        }

        problems
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Server address, `ip:port`
    pub address: String,

    /// Key announced during the handshake. Without one the server registers
    /// the client under its socket address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,

    /// Limit for connecting and handshaking together
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    /// Default wait for a correlated reply
    #[serde(with = "millis")]
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8765".into(),
            connection_key: None,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: timeout::RESPONSE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Defaults targeting `address`
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        check_socket_addr(&mut problems, "Client", &self.address);

        if let Some(len) = self.connection_key.as_ref().map(String::len) {
            if len > 256 {
                problems.push(format!("Connection key too long: {len} bytes (maximum: 256)"));
            }
        }
        if self.connection_timeout < Duration::from_millis(100) {
            problems.push("Connection timeout too short (minimum: 100ms)".into());
        }
        if self.response_timeout < Duration::from_millis(10) {
            problems.push("Response timeout too short (minimum: 10ms)".into());
        }

        problems
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Largest frame payload accepted or produced, in bytes
    pub max_payload_size: usize,

    /// Limit for writing a single frame
    #[serde(with = "millis")]
    pub send_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            send_timeout: timeout::DEFAULT_TIMEOUT,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.max_payload_size {
            0 => problems.push("Max payload size cannot be 0".into()),
            n if n < 1024 => problems.push(format!("Max payload size too small: {n} bytes (minimum: 1 KB)")),
            n if n > u32::MAX as usize => problems.push(format!(
                "Max payload size too large: {n} bytes (frame length field is 32 bits)"
            )),
            _ => {}
        }
        if self.send_timeout < Duration::from_millis(10) {
            problems.push("Send timeout too short (minimum: 10ms)".into());
        }

        problems
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Name attached to every log record
    pub app_name: String,

    #[serde(with = "level")]
    pub log_level: Level,

    /// Emit JSON lines instead of human-readable text
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: "fastsocket".into(),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        match self.app_name.len() {
            0 => vec!["Application name cannot be empty".into()],
            n if n > 64 => vec![format!("Application name too long: {n} characters (maximum: 64)")],
            _ => Vec::new(),
        }
    }
}

/// `Duration` as integer milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `tracing::Level` as a lowercase name
mod level {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(value: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| D::Error::custom(format!("unknown log level '{name}'")))
    }
}
