//! Configuration module for the ws-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::upgrade::{OriginPolicy, UpgradeConfig};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "ws-echo")]
#[command(author = "ws-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A WebSocket echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Page served on `/` to bootstrap a browser client
    #[arg(short = 'p', long)]
    pub page: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// WebSocket read buffer size in bytes
    #[arg(long)]
    pub read_buffer_size: Option<usize>,

    /// WebSocket write buffer size in bytes
    #[arg(long)]
    pub write_buffer_size: Option<usize>,

    /// Accept upgrades from any origin (demonstration mode)
    #[arg(long)]
    pub allow_any_origin: bool,

    /// Origin allowed to upgrade, may be repeated (e.g., https://example.com)
    #[arg(long = "allowed-origin")]
    pub allowed_origins: Vec<String>,

    /// Seconds to wait for open sessions to close on shutdown
    #[arg(long)]
    pub shutdown_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
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
    /// Static page served on `/`
    #[serde(default = "default_page")]
    pub page: PathBuf,
    /// Seconds to wait for sessions to drain on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            page: default_page(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// WebSocket upgrade configuration
#[derive(Debug, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default)]
    pub allow_any_origin: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            allow_any_origin: false,
            allowed_origins: Vec::new(),
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
    "0.0.0.0:8080".to_string()
}

fn default_page() -> PathBuf {
    PathBuf::from("static/websockets.html")
}

fn default_buffer_size() -> usize {
    1024
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub page: PathBuf,
    pub workers: Option<usize>,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub allow_any_origin: bool,
    pub allowed_origins: Vec<String>,
    pub shutdown_timeout: Duration,
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            page: cli.page.unwrap_or(toml_config.server.page),
            workers: cli.workers.or(toml_config.server.workers),
            read_buffer_size: cli
                .read_buffer_size
                .unwrap_or(toml_config.websocket.read_buffer_size),
            write_buffer_size: cli
                .write_buffer_size
                .unwrap_or(toml_config.websocket.write_buffer_size),
            allow_any_origin: cli.allow_any_origin || toml_config.websocket.allow_any_origin,
            allowed_origins: if cli.allowed_origins.is_empty() {
                toml_config.websocket.allowed_origins
            } else {
                cli.allowed_origins
            },
            shutdown_timeout: Duration::from_secs(
                cli.shutdown_timeout
                    .unwrap_or(toml_config.server.shutdown_timeout),
            ),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        if config.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be non-zero"));
        }
        if config.write_buffer_size == 0 {
            return Err(ConfigError::Invalid("write_buffer_size must be non-zero"));
        }
        if config.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be non-zero"));
        }

        Ok(config)
    }

    /// Build the upgrade settings handed to the upgrade handler.
    pub fn upgrade_config(&self) -> UpgradeConfig {
        let origin_policy = if self.allow_any_origin {
            OriginPolicy::AllowAny
        } else {
            OriginPolicy::allow_list(self.allowed_origins.iter().cloned())
        };

        UpgradeConfig {
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            origin_policy,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
