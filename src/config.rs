//! # Configuration Management
//!
//! Centralized configuration for the server listener, the client connector and the
//! framing layer they share.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment overrides via `from_env()` (`FRAMELINK_*` variables)
//! - Direct instantiation with defaults
//!
//! ## Example
//! ```toml
//! [server]
//! address = "0.0.0.0:5000"
//!
//! [client]
//! address = "127.0.0.1:5000"
//! reconnect_delay = 3000
//!
//! [transport]
//! max_frame_size = 1048576
//! ```

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default maximum frame size, header included (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default capacity of a new receive buffer (8 KiB)
pub const INITIAL_BUFFER_SIZE: usize = 8 * 1024;

/// Default ceiling for receive buffer growth (1 MiB)
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Default backlog above which the client stops reading
pub const BACKPRESSURE_HIGH_THRESHOLD: usize = 100;

/// Default delay between reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Default listen / connect address
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:5000";

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client connector configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Framing and buffer limits shared by both sides
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("FRAMELINK_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("FRAMELINK_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(delay) = std::env::var("FRAMELINK_RECONNECT_DELAY_MS") {
            config.client.reconnect_delay = Duration::from_millis(parse_env(
                "FRAMELINK_RECONNECT_DELAY_MS",
                &delay,
            )?);
        }

        if let Ok(threshold) = std::env::var("FRAMELINK_BACKPRESSURE_HIGH_THRESHOLD") {
            config.client.backpressure_high_threshold =
                parse_env("FRAMELINK_BACKPRESSURE_HIGH_THRESHOLD", &threshold)?;
        }

        if let Ok(size) = std::env::var("FRAMELINK_MAX_FRAME_SIZE") {
            config.transport.max_frame_size = parse_env("FRAMELINK_MAX_FRAME_SIZE", &size)?;
        }

        if let Ok(size) = std::env::var("FRAMELINK_INITIAL_BUFFER_SIZE") {
            config.transport.initial_buffer_size =
                parse_env("FRAMELINK_INITIAL_BUFFER_SIZE", &size)?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| ProtocolError::Config(format!("Invalid value for {name}: '{value}'")))
}

pub(crate) fn strict(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::Config(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

/// Server listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:5000")
    pub address: String,

    /// Maximum number of concurrent connections; accepting pauses at the limit
    pub max_connections: usize,

    /// Number of receive slabs held by the pooled buffer arena
    pub arena_slabs: usize,

    /// How long a graceful shutdown waits for connections to drain
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from(DEFAULT_ADDRESS),
            max_connections: 1024,
            arena_slabs: 1024,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:5000')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.arena_slabs > 1_000_000 {
            errors.push(format!(
                "Arena slab count too large: {} (max recommended: 1,000,000)",
                self.arena_slabs
            ));
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client connector configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote host:port to connect to
    pub address: String,

    /// Delay between a failure and the next connect attempt
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Timeout for a single connect attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Unhandled-frame backlog above which reads are suspended
    pub backpressure_high_threshold: usize,

    /// Queue depth above which the sender yields between items
    pub send_queue_yield_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from(DEFAULT_ADDRESS),
            reconnect_delay: RECONNECT_DELAY,
            connect_timeout: Duration::from_secs(5),
            backpressure_high_threshold: BACKPRESSURE_HIGH_THRESHOLD,
            send_queue_yield_depth: 50,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if !self.address.contains(':') {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'host:port')",
                self.address
            ));
        }

        if self.reconnect_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay.as_secs() > 300 {
            errors.push("Reconnect delay too long (maximum: 300s)".to_string());
        }

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        }

        if self.backpressure_high_threshold < 2 {
            errors.push("Backpressure high threshold must be at least 2".to_string());
        } else if self.backpressure_high_threshold > 1_000_000 {
            errors.push(format!(
                "Backpressure high threshold too large: {} (max recommended: 1,000,000)",
                self.backpressure_high_threshold
            ));
        }

        errors
    }
}

/// Framing and buffer limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest accepted frame, header included
    pub max_frame_size: usize,

    /// Capacity of a new receive buffer (also the arena slab size)
    pub initial_buffer_size: usize,

    /// Ceiling for receive buffer growth
    pub max_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            initial_buffer_size: INITIAL_BUFFER_SIZE,
            max_buffer_size: MAX_BUFFER_SIZE,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < crate::core::packet::HEADER_SIZE {
            errors.push("Max frame size must be at least the 8-byte header".to_string());
        } else if self.max_frame_size > u32::MAX as usize {
            errors.push("Max frame size cannot exceed u32::MAX".to_string());
        }

        if self.initial_buffer_size < 64 {
            errors.push("Initial buffer size too small (minimum: 64 bytes)".to_string());
        }

        if self.initial_buffer_size > self.max_buffer_size {
            errors.push("Initial buffer size cannot be larger than max buffer size".to_string());
        }

        if self.max_buffer_size < self.max_frame_size {
            errors.push(
                "Max buffer size must be able to hold one max-size frame".to_string(),
            );
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("framelink"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
