//! Configuration module for linefetch.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::ResponseMode;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "linefetch")]
#[command(author = "linefetch authors")]
#[command(version = "0.1.0")]
#[command(about = "Serve or fetch a file over a line-oriented TCP protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Response framing, must match on both ends
    #[arg(long, value_enum, global = true)]
    pub mode: Option<ResponseMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the file server
    Serve {
        /// Address to bind to (e.g., 127.0.0.1:8989)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Directory that bounds every served path
        #[arg(short = 'r', long)]
        root: Option<PathBuf>,

        /// Maximum number of concurrent connections
        #[arg(long)]
        max_connections: Option<usize>,
    },
    /// Request a single file from a server
    Fetch {
        /// Path to request
        path: String,

        /// Server host
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Write the response to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Root directory for served files
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            root: default_root(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Largest response body the client will accept
    #[serde(default = "default_max_response_size")]
    pub max_response_size: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_response_size: default_max_response_size(),
        }
    }
}

/// Protocol limits shared by both ends
#[derive(Debug, Deserialize)]
pub struct TransferSection {
    #[serde(default)]
    pub mode: ResponseMode,
    /// File read chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Longest accepted request line, newline excluded
    #[serde(default = "default_max_request_line")]
    pub max_request_line: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            mode: ResponseMode::default(),
            chunk_size: default_chunk_size(),
            max_request_line: default_max_request_line(),
            request_timeout_ms: default_request_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8989".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_backlog() -> u32 {
    128
}

fn default_max_connections() -> usize {
    1024
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_max_response_size() -> u64 {
    64 * 1024 * 1024 // 64 MB
}

fn default_chunk_size() -> usize {
    4096
}

fn default_max_request_line() -> usize {
    4096
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Largest accepted `max_connections`.
///
/// Bounded by what a `Semaphore` can hold and by the single
/// `acquire_many` call that drains connections on shutdown.
pub const MAX_CONNECTIONS_LIMIT: usize = {
    let permits = tokio::sync::Semaphore::MAX_PERMITS;
    if permits < u32::MAX as usize {
        permits
    } else {
        u32::MAX as usize
    }
};

/// Limits applied by the transfer handler to each connection.
#[derive(Debug, Clone)]
pub struct TransferLimits {
    pub mode: ResponseMode,
    pub chunk_size: usize,
    pub max_request_line: usize,
    pub request_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for TransferLimits {
    fn default() -> Self {
        TransferLimits::from_section(&TransferSection::default())
    }
}

impl TransferLimits {
    fn from_section(section: &TransferSection) -> Self {
        TransferLimits {
            mode: section.mode,
            chunk_size: section.chunk_size,
            max_request_line: section.max_request_line,
            request_timeout: Duration::from_millis(section.request_timeout_ms),
            write_timeout: Duration::from_millis(section.write_timeout_ms),
        }
    }
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub root: PathBuf,
    pub backlog: u32,
    pub max_connections: usize,
    pub limits: TransferLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let section = ServerSection::default();
        ServerConfig {
            listen: section.listen,
            root: section.root,
            backlog: section.backlog,
            max_connections: section.max_connections,
            limits: TransferLimits::default(),
        }
    }
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub mode: ResponseMode,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_response_size: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let section = ClientSection::default();
        ClientConfig {
            host: section.host,
            port: section.port,
            mode: ResponseMode::default(),
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            read_timeout: Duration::from_millis(section.read_timeout_ms),
            max_response_size: section.max_response_size,
        }
    }
}

/// What the binary was asked to do, with its resolved configuration.
#[derive(Debug, Clone)]
pub enum Action {
    Serve(ServerConfig),
    Fetch {
        client: ClientConfig,
        path: String,
        output: Option<PathBuf>,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub action: Action,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut limits = TransferLimits::from_section(&toml_config.transfer);
        if let Some(mode) = cli.mode {
            limits.mode = mode;
        }

        let action = match cli.command {
            CliCommand::Serve {
                listen,
                root,
                max_connections,
            } => Action::Serve(ServerConfig {
                listen: listen.unwrap_or(toml_config.server.listen),
                root: root.unwrap_or(toml_config.server.root),
                backlog: toml_config.server.backlog,
                max_connections: max_connections
                    .unwrap_or(toml_config.server.max_connections),
                limits,
            }),
            CliCommand::Fetch {
                path,
                host,
                port,
                output,
            } => Action::Fetch {
                client: ClientConfig {
                    host: host.unwrap_or(toml_config.client.host),
                    port: port.unwrap_or(toml_config.client.port),
                    mode: limits.mode,
                    connect_timeout: Duration::from_millis(
                        toml_config.client.connect_timeout_ms,
                    ),
                    read_timeout: Duration::from_millis(toml_config.client.read_timeout_ms),
                    max_response_size: toml_config.client.max_response_size,
                },
                path,
                output,
            },
        };

        let config = Config {
            action,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match &self.action {
            Action::Serve(server) => {
                if server.max_connections == 0 {
                    return Err(ConfigError::Invalid("max_connections must be at least 1"));
                }
                if server.max_connections > MAX_CONNECTIONS_LIMIT {
                    return Err(ConfigError::Invalid("max_connections is too large"));
                }
                if server.limits.chunk_size == 0 {
                    return Err(ConfigError::Invalid("chunk_size must be at least 1"));
                }
                if server.limits.max_request_line == 0 {
                    return Err(ConfigError::Invalid("max_request_line must be at least 1"));
                }
            }
            Action::Fetch { client, .. } => {
                if client.max_response_size == 0 {
                    return Err(ConfigError::Invalid("max_response_size must be at least 1"));
                }
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
