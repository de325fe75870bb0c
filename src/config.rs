//! Configuration module for the grow-a-hub server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{DEFAULT_MAX_ARGUMENTS, DEFAULT_MAX_MESSAGE_SIZE};
use crate::runtime::HubConfig;

/// Command-line arguments for the hub server
#[derive(Parser, Debug)]
#[command(name = "grow-a-hub")]
#[command(author = "grow-a-hub authors")]
#[command(version = "0.1.0")]
#[command(about = "A real-time RPC hub speaking the JSON hub protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:5000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Largest accepted message in bytes
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Report handler failure reasons to clients
    #[arg(long)]
    pub detailed_errors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Hub limits and timers
#[derive(Debug, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_arguments")]
    pub max_arguments: usize,
    /// Outbound frames buffered per connection
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub detailed_errors: bool,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_arguments: default_max_arguments(),
            send_buffer: default_send_buffer(),
            send_timeout_ms: default_send_timeout_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            client_timeout_secs: default_client_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            detailed_errors: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_arguments() -> usize {
    DEFAULT_MAX_ARGUMENTS
}

fn default_send_buffer() -> usize {
    256
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_keepalive_interval_secs() -> u64 {
    15
}

fn default_client_timeout_secs() -> u64 {
    30 // twice the keep-alive interval
}

fn default_handshake_timeout_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub max_arguments: usize,
    pub send_buffer: usize,
    pub send_timeout: Duration,
    pub keepalive_interval: Duration,
    pub client_timeout: Duration,
    pub handshake_timeout: Duration,
    pub detailed_errors: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let hub = toml_config.hub;
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_message_size: cli.max_message_size.unwrap_or(hub.max_message_size),
            max_arguments: hub.max_arguments,
            send_buffer: hub.send_buffer,
            send_timeout: Duration::from_millis(hub.send_timeout_ms),
            keepalive_interval: Duration::from_secs(hub.keepalive_interval_secs),
            client_timeout: Duration::from_secs(hub.client_timeout_secs),
            handshake_timeout: Duration::from_secs(hub.handshake_timeout_secs),
            detailed_errors: cli.detailed_errors || hub.detailed_errors,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("server.max_connections", self.max_connections as u128),
            ("hub.max_message_size", self.max_message_size as u128),
            ("hub.send_buffer", self.send_buffer as u128),
            ("hub.send_timeout_ms", self.send_timeout.as_millis()),
            ("hub.keepalive_interval_secs", self.keepalive_interval.as_millis()),
            ("hub.client_timeout_secs", self.client_timeout.as_millis()),
            ("hub.handshake_timeout_secs", self.handshake_timeout.as_millis()),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "server.workers must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Runtime settings for the hub.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.max_connections,
            max_message_size: self.max_message_size,
            max_arguments: self.max_arguments,
            send_buffer: self.send_buffer,
            send_timeout: self.send_timeout,
            keepalive_interval: self.keepalive_interval,
            client_timeout: self.client_timeout,
            handshake_timeout: self.handshake_timeout,
            detailed_errors: self.detailed_errors,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
