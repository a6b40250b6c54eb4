//! Configuration for the trellis server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author = "trellis authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented telnet server built on trellis sessions", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:5555)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Accept loop poll interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Outbound packet queue capacity per session
    #[arg(long)]
    pub send_queue: Option<usize>,

    /// Inbound packet queue capacity per session
    #[arg(long)]
    pub recv_queue: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Accept loop poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            backlog: default_backlog(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Per-session queue configuration
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_queue_size")]
    pub send_queue_size: usize,
    #[serde(default = "default_queue_size")]
    pub recv_queue_size: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            send_queue_size: default_queue_size(),
            recv_queue_size: default_queue_size(),
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
    "127.0.0.1:5555".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_queue_size() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Queue capacities handed to every session a server creates.
///
/// A capacity of 0 makes the queue a hand-off: a packet only moves when the
/// consuming loop is waiting for it, so a non-blocking send with no waiting
/// write loop fails with `WriteBlocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub send_queue_size: usize,
    pub recv_queue_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_size: default_queue_size(),
            recv_queue_size: default_queue_size(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub backlog: u32,
    pub poll_interval: Duration,
    pub session: SessionConfig,
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

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let poll_interval_ms = cli
            .poll_interval_ms
            .unwrap_or(toml_config.server.poll_interval_ms);
        if poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll interval must be greater than zero"));
        }

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            poll_interval: Duration::from_millis(poll_interval_ms),
            session: SessionConfig {
                send_queue_size: cli
                    .send_queue
                    .unwrap_or(toml_config.session.send_queue_size),
                recv_queue_size: cli
                    .recv_queue
                    .unwrap_or(toml_config.session.recv_queue_size),
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["trellis"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:5555");
        assert_eq!(config.server.poll_interval_ms, 1000);
        assert_eq!(config.session.send_queue_size, 10);
        assert_eq!(config.session.recv_queue_size, 10);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:2323"
            workers = 4
            poll_interval_ms = 250

            [session]
            send_queue_size = 64
            recv_queue_size = 0

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:2323");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.server.poll_interval_ms, 250);
        assert_eq!(config.session.send_queue_size, 64);
        assert_eq!(config.session.recv_queue_size, 0);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:2323"
            [session]
            send_queue_size = 64
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--listen", "127.0.0.1:7000", "--recv-queue", "3"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.session.send_queue_size, 64);
        assert_eq!(config.session.recv_queue_size, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = Config::merge(cli(&["--poll-interval-ms", "0"]), TomlConfig::default());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
