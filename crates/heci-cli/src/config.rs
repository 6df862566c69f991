//! Configuration management for the `heci` command.
//!
//! Settings are read from a TOML file, then environment variables and
//! command-line flags are layered on top.
//! The default configuration path is `~/.config/heci/config.toml`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use heci::{ConnectOptions, WriteMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("device path must not be empty; set [device] path, HECI_DEVICE or --device")]
    EmptyDevicePath,

    #[error("read_queue_depth must be between 1 and 1024, got {0}")]
    InvalidQueueDepth(usize),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound on buffered inbound messages.
const MAX_READ_QUEUE_DEPTH: usize = 1024;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Which device node to open.
    pub device: DeviceConfig,

    /// Session behaviour.
    pub session: SessionConfig,

    /// Logging.
    pub logging: LoggingConfig,
}

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Path of the host controller device.
    pub path: String,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Write flow-control discipline (`pipelined` or `read-gated`).
    pub write_mode: WriteMode,

    /// Inbound messages buffered before reads pause.
    pub read_queue_depth: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: heci::backend::DEFAULT_DEVICE_PATH.to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::default(),
            read_queue_depth: heci::runtime::DEFAULT_READ_QUEUE_DEPTH,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("heci")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - HECI_DEVICE: Override the device path
    /// - HECI_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("HECI_DEVICE") {
            if !path.is_empty() {
                tracing::info!("Overriding device path from environment: {}", path);
                self.device.path = path;
            }
        }

        if let Ok(level) = std::env::var("HECI_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.path.trim().is_empty() {
            return Err(ConfigError::EmptyDevicePath);
        }

        let depth = self.session.read_queue_depth;
        if !(1..=MAX_READ_QUEUE_DEPTH).contains(&depth) {
            return Err(ConfigError::InvalidQueueDepth(depth));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Connect options derived from the `[session]` section.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::default().with_write_mode(self.session.write_mode)
    }

    /// Load configuration from a file.
    ///
    /// A missing file yields the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read config file: {}", path.display()))
            }
        }
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("Invalid TOML configuration")
    }

    /// Writes this configuration to `path`, creating parent directories.
    ///
    /// An existing file is only replaced when `overwrite` is set.
    pub fn write_to<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        if !overwrite && path.exists() {
            bail!(
                "Config file already exists: {} (use --force to replace it)",
                path.display()
            );
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let contents = format!("# heci configuration\n\n{}", self.to_toml()?);
        fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration written");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
