//! Configuration for the bridge-echo backend.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use bridge_backend::BackendConfig;
use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

/// Command-line arguments for the echo backend
#[derive(Parser, Debug)]
#[command(name = "bridge-echo")]
#[command(version = "0.1.0")]
#[command(about = "Example backend that echoes request bodies back through the bridge", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Front-end address to connect to (e.g., 127.0.0.1:8081)
    #[arg(short, long)]
    pub address: Option<String>,

    /// Bodies up to this many bytes are buffered automatically
    #[arg(long)]
    pub max_auto_buffer_size: Option<u64>,

    /// Limit on bytes held in body buffers across all requests
    #[arg(long)]
    pub max_waiting_buffer_total: Option<usize>,

    /// Ask for every streamed body to be buffered as well
    #[arg(long)]
    pub buffer_all: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub buffering: BufferingSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Connection settings
#[derive(Debug, Deserialize)]
pub struct BackendSection {
    /// Front-end address
    #[serde(default = "default_address")]
    pub address: String,
    /// Milliseconds a single read may block
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    /// Buffer streamed bodies as well
    #[serde(default)]
    pub buffer_all: bool,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            recv_timeout_ms: default_recv_timeout_ms(),
            buffer_all: false,
        }
    }
}

/// Body buffering limits
#[derive(Debug, Deserialize)]
pub struct BufferingSection {
    #[serde(default = "default_max_auto_buffer_size")]
    pub max_auto_buffer_size: u64,
    #[serde(default = "default_max_waiting_buffer_total")]
    pub max_waiting_buffer_total: usize,
    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,
}

impl Default for BufferingSection {
    fn default() -> Self {
        Self {
            max_auto_buffer_size: default_max_auto_buffer_size(),
            max_waiting_buffer_total: default_max_waiting_buffer_total(),
            initial_buffer_size: default_initial_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
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

fn default_address() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_recv_timeout_ms() -> u64 {
    500
}

fn default_max_auto_buffer_size() -> u64 {
    BackendConfig::default().max_auto_buffer_size
}

fn default_max_waiting_buffer_total() -> usize {
    BackendConfig::default().max_waiting_buffer_total
}

fn default_initial_buffer_size() -> usize {
    BackendConfig::default().initial_buffer_size
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub buffer_all: bool,
    pub log_level: String,
    pub backend: BackendConfig,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let file = match &cli.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
                toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        Ok(Self::merge(cli, file))
    }

    /// Merge CLI args over file values.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        let backend = BackendConfig {
            max_auto_buffer_size: cli
                .max_auto_buffer_size
                .unwrap_or(file.buffering.max_auto_buffer_size),
            max_waiting_buffer_total: cli
                .max_waiting_buffer_total
                .unwrap_or(file.buffering.max_waiting_buffer_total),
            initial_buffer_size: file.buffering.initial_buffer_size,
            recv_timeout: Duration::from_millis(file.backend.recv_timeout_ms),
            ..BackendConfig::default()
        };

        Config {
            address: cli.address.unwrap_or(file.backend.address),
            buffer_all: cli.buffer_all || file.backend.buffer_all,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
            backend,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.backend.address, "127.0.0.1:8081");
        assert_eq!(config.backend.recv_timeout_ms, 500);
        assert_eq!(config.buffering.max_auto_buffer_size, 16 * 1024 * 1024);
        assert_eq!(config.buffering.max_waiting_buffer_total, 1024 * 1024 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [backend]
            address = "10.0.0.5:9000"
            buffer_all = true

            [buffering]
            max_auto_buffer_size = 4096
            initial_buffer_size = 1024

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.address, "10.0.0.5:9000");
        assert!(config.backend.buffer_all);
        assert_eq!(config.buffering.max_auto_buffer_size, 4096);
        assert_eq!(config.buffering.initial_buffer_size, 1024);
        assert_eq!(config.buffering.max_waiting_buffer_total, 1024 * 1024 * 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [backend]
            address = "10.0.0.5:9000"

            [buffering]
            max_auto_buffer_size = 4096

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();
        let cli = CliArgs::parse_from([
            "bridge-echo",
            "--address",
            "127.0.0.1:7000",
            "--log-level",
            "trace",
        ]);

        let config = Config::merge(cli, file);
        assert_eq!(config.address, "127.0.0.1:7000");
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.backend.max_auto_buffer_size, 4096);
        assert!(!config.buffer_all);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::FileRead(
            PathBuf::from("/missing.toml"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        );
        assert_eq!(
            err.to_string(),
            "Failed to read config file '/missing.toml': not found"
        );
    }
}
