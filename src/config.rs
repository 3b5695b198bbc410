//! Configuration module for echo-pair.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echo-pair")]
#[command(author = "echo-pair authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server and correlating echo client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub mode: Mode,
}

/// What to run.
#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the echo server
    Serve {
        /// Address to bind to (e.g., 0.0.0.0:8080)
        #[arg(short = 'l', long)]
        listen: Option<String>,
    },
    /// Send messages to an echo server and print the replies
    Send {
        /// Echo server address (e.g., localhost:8080)
        #[arg(short = 's', long)]
        server: Option<String>,

        /// Number of generated messages when none are given
        #[arg(short = 'n', long, default_value_t = 100)]
        count: usize,

        /// Event loop threads
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// Reaction to a failed connect
        #[arg(long, value_enum)]
        on_connect_error: Option<ConnectErrorPolicy>,

        /// Messages to send
        messages: Vec<String>,
    },
}

/// What the client does when a connect attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectErrorPolicy {
    /// Tear down the whole client: in-flight requests fail, later sends are rejected.
    Shutdown,
    /// Fail only the request that tried to connect.
    FailRequest,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrently served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Echo server to connect to
    #[serde(default = "default_server")]
    pub server: String,
    /// Event loop threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Largest reply accepted before the terminator is seen
    #[serde(default = "default_max_reply_size")]
    pub max_reply_size: usize,
    #[serde(default = "default_connect_error_policy")]
    pub on_connect_error: ConnectErrorPolicy,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            workers: default_workers(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_reply_size: default_max_reply_size(),
            on_connect_error: default_connect_error_policy(),
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
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_server() -> String {
    "localhost:8080".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_reply_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_max_reply_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_connect_error_policy() -> ConnectErrorPolicy {
    ConnectErrorPolicy::Shutdown
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved echo server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let section = ServerSection::default();
        Self {
            listen: section.listen,
            max_connections: section.max_connections,
        }
    }
}

/// Resolved echo client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub workers: usize,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_reply_size: usize,
    pub on_connect_error: ConnectErrorPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_section(ClientSection::default())
    }
}

impl ClientConfig {
    fn from_section(section: ClientSection) -> Self {
        Self {
            server: section.server,
            workers: section.workers,
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            reply_timeout: Duration::from_millis(section.reply_timeout_ms),
            shutdown_timeout: Duration::from_millis(section.shutdown_timeout_ms),
            max_reply_size: section.max_reply_size,
            on_connect_error: section.on_connect_error,
        }
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "client.workers",
                reason: "must be at least 1",
            });
        }
        if self.max_reply_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "client.max_reply_size",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// What the binary was asked to do, with settings resolved.
#[derive(Debug, Clone)]
pub enum Command {
    Serve(ServerConfig),
    Send {
        client: ClientConfig,
        messages: Vec<String>,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let command = match cli.mode {
            Mode::Serve { listen } => Command::Serve(ServerConfig {
                listen: listen.unwrap_or(toml_config.server.listen),
                max_connections: toml_config.server.max_connections,
            }),
            Mode::Send {
                server,
                count,
                workers,
                on_connect_error,
                messages,
            } => {
                let mut client = ClientConfig::from_section(toml_config.client);
                if let Some(server) = server {
                    client.server = server;
                }
                if let Some(workers) = workers {
                    client.workers = workers;
                }
                if let Some(policy) = on_connect_error {
                    client.on_connect_error = policy;
                }
                client.validate()?;

                let messages = if messages.is_empty() {
                    (1..=count).map(|n| format!("msg-{n}")).collect()
                } else {
                    messages
                };

                Command::Send { client, messages }
            }
        };

        Ok(Config { command, log_level })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.client.server, "localhost:8080");
        assert_eq!(config.client.workers, 1);
        assert_eq!(config.client.on_connect_error, ConnectErrorPolicy::Shutdown);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            max_connections = 16

            [client]
            server = "127.0.0.1:9000"
            workers = 2
            reply_timeout_ms = 250
            on_connect_error = "fail-request"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.client.server, "127.0.0.1:9000");
        assert_eq!(config.client.workers, 2);
        assert_eq!(config.client.reply_timeout_ms, 250);
        assert_eq!(config.client.connect_timeout_ms, 5_000);
        assert_eq!(
            config.client.on_connect_error,
            ConnectErrorPolicy::FailRequest
        );
        assert_eq!(config.logging.level, "debug");

        let client = ClientConfig::from_section(config.client);
        assert_eq!(client.reply_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_send_generates_messages() {
        let cli = CliArgs::parse_from(["echo-pair", "send", "--count", "3"]);
        let config = Config::from_cli(cli).unwrap();
        match config.command {
            Command::Send { client, messages } => {
                assert_eq!(client.server, "localhost:8080");
                assert_eq!(messages, vec!["msg-1", "msg-2", "msg-3"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliArgs::parse_from([
            "echo-pair",
            "--log-level",
            "trace",
            "send",
            "--server",
            "10.0.0.1:7",
            "--on-connect-error",
            "fail-request",
            "hello",
        ]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.log_level, "trace");
        match config.command {
            Command::Send { client, messages } => {
                assert_eq!(client.server, "10.0.0.1:7");
                assert_eq!(client.on_connect_error, ConnectErrorPolicy::FailRequest);
                assert_eq!(messages, vec!["hello"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_serve_listen_override() {
        let cli = CliArgs::parse_from(["echo-pair", "serve", "-l", "127.0.0.1:0"]);
        match Config::from_cli(cli).unwrap().command {
            Command::Serve(server) => {
                assert_eq!(server.listen, "127.0.0.1:0");
                assert_eq!(server.max_connections, 10000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cli = CliArgs::parse_from(["echo-pair", "send", "-w", "0"]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::InvalidValue {
                field: "client.workers",
                ..
            })
        ));
    }
}
