//! Configuration module for session-stream.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "session-stream")]
#[command(version)]
#[command(about = "Stream and connection transport server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind listeners to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port for a single listener, replacing the configured ones
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Protocol served on --port (ping, echo)
    #[arg(long, default_value = "ping")]
    pub protocol: String,

    /// Ceiling on live connections
    #[arg(short = 'c', long)]
    pub max_connections: Option<usize>,

    /// Seconds a socket may sit idle before it is closed
    #[arg(short = 't', long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One listener: the port doubles as the dispatch key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenerConfig {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            listeners: default_listeners(),
        }
    }
}

/// Resource limits and timeouts
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_streams")]
    pub max_streams_per_connection: usize,
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// Socket idle deadline in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Write deadline in seconds (0 = same as the idle deadline)
    #[serde(default)]
    pub write_timeout_secs: u64,
    /// Registry eviction threshold in seconds
    #[serde(default = "default_connection_idle")]
    pub connection_idle_secs: u64,
    /// Interval for running the eviction sweep in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_streams_per_connection: default_max_streams(),
            receive_buffer_size: default_receive_buffer_size(),
            idle_timeout_secs: default_idle_timeout(),
            write_timeout_secs: 0,
            connection_idle_secs: default_connection_idle(),
            cleanup_interval_secs: default_cleanup_interval(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_protocol() -> String {
    "ping".to_string()
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig {
        port: 7878,
        protocol: default_protocol(),
    }]
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_streams() -> usize {
    16
}

fn default_receive_buffer_size() -> usize {
    16 * 1024
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_connection_idle() -> u64 {
    600
}

fn default_cleanup_interval() -> u64 {
    60 // 60 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub listeners: Vec<ListenerConfig>,
    pub max_connections: usize,
    pub max_streams_per_connection: usize,
    pub receive_buffer_size: usize,
    pub idle_timeout: Duration,
    pub write_timeout: Option<Duration>,
    pub connection_idle: Duration,
    pub cleanup_interval: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::from_sources(cli, toml_config)
    }

    /// Merge CLI args over a parsed TOML config and validate the result.
    pub fn from_sources(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listeners = match cli.port {
            Some(port) => vec![ListenerConfig {
                port,
                protocol: cli.protocol,
            }],
            None => toml_config.server.listeners,
        };
        let limits = toml_config.limits;

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            listeners,
            max_connections: cli.max_connections.unwrap_or(limits.max_connections),
            max_streams_per_connection: limits.max_streams_per_connection,
            receive_buffer_size: limits.receive_buffer_size,
            idle_timeout: Duration::from_secs(cli.idle_timeout.unwrap_or(limits.idle_timeout_secs)),
            write_timeout: (limits.write_timeout_secs > 0)
                .then(|| Duration::from_secs(limits.write_timeout_secs)),
            connection_idle: Duration::from_secs(limits.connection_idle_secs),
            cleanup_interval: Duration::from_secs(limits.cleanup_interval_secs),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::Invalid("at least one listener is required".into()));
        }
        let mut ports = HashSet::new();
        for listener in &self.listeners {
            if !ports.insert(listener.port) {
                return Err(ConfigError::Invalid(format!(
                    "port {} is configured more than once",
                    listener.port
                )));
            }
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        if self.max_streams_per_connection == 0 {
            return Err(ConfigError::Invalid(
                "max_streams_per_connection must be positive".into(),
            ));
        }
        if self.receive_buffer_size == 0 {
            return Err(ConfigError::Invalid("receive_buffer_size must be positive".into()));
        }
        if self.idle_timeout.is_zero() || self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
