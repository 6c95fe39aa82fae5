//! Configuration for the streaming engine
//!
//! Configuration is organized into sections:
//! - Connection (firmware dialect, port, baud rate)
//! - Streaming (receive buffer override, single-step mode, status polling)
//! - Watchdog (connection liveness checks)
//! - Settings (firmware setting write timeout)
//!
//! Files are TOML or JSON, chosen by extension. Every section has defaults,
//! so a file only needs the values it changes.

use crate::error::{SettingsError, SettingsResult};
use anyhow::Context;
use cncstream_communication::{ConnectionWatchConfig, ControllerConfig, Firmware};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the configuration file inside the platform config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

const APP_DIR_NAME: &str = "cncstream";

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Firmware dialect spoken by the controller
    pub firmware: Firmware,
    /// Serial port, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: Option<String>,
    pub baud_rate: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            firmware: Firmware::Grbl,
            port: None,
            baud_rate: 115200,
        }
    }
}

/// Streaming settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Receive buffer size override in bytes
    pub buffer_size: Option<usize>,
    pub single_step: bool,
    pub status_poll_enabled: bool,
    /// Status poll interval in milliseconds
    pub status_poll_rate_ms: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            buffer_size: None,
            single_step: false,
            status_poll_enabled: true,
            status_poll_rate_ms: 200,
        }
    }
}

/// Connection watchdog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub enabled: bool,
    pub check_interval_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 2000,
        }
    }
}

/// Firmware setting synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizerSettings {
    /// How long a setting write waits for the firmware
    pub timeout_ms: u64,
}

impl Default for SynchronizerSettings {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionSettings,
    pub streaming: StreamingSettings,
    pub watchdog: WatchdogSettings,
    pub settings: SynchronizerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

fn format_for(path: &Path) -> SettingsResult<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        other => Err(SettingsError::UnsupportedFormat(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a config file (TOML or JSON)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = format_for(path)?;
        let content = std::fs::read_to_string(path)?;
        let config: Self = match format {
            Format::Toml => toml::from_str(&content)?,
            Format::Json => serde_json::from_str(&content)?,
        };
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Validate and save to a config file (TOML or JSON)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;
        let content = match format_for(path)? {
            Format::Toml => toml::to_string_pretty(self)?,
            Format::Json => serde_json::to_string_pretty(self)?,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        tracing::debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> SettingsResult<()> {
        if self.connection.baud_rate == 0 {
            return Err(SettingsError::invalid(
                "connection.baud_rate",
                "must be greater than zero",
            ));
        }
        if self.connection.port.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(SettingsError::invalid("connection.port", "must not be empty"));
        }
        if self.streaming.buffer_size == Some(0) {
            return Err(SettingsError::invalid(
                "streaming.buffer_size",
                "must be greater than zero",
            ));
        }
        if self.streaming.status_poll_rate_ms == 0 {
            return Err(SettingsError::invalid(
                "streaming.status_poll_rate_ms",
                "must be greater than zero",
            ));
        }
        if self.watchdog.check_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "watchdog.check_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.settings.timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "settings.timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Controller configuration for these settings
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            firmware: self.connection.firmware,
            single_step: self.streaming.single_step,
            buffer_size: self.streaming.buffer_size,
            status_updates_enabled: self.streaming.status_poll_enabled,
            status_update_rate_ms: self.streaming.status_poll_rate_ms,
            watchdog: ConnectionWatchConfig {
                check_interval_ms: self.watchdog.check_interval_ms,
                enabled: self.watchdog.enabled,
            },
            settings_timeout_ms: self.settings.timeout_ms,
        }
    }
}

/// Platform config directory for CNCStream, e.g. `~/.config/cncstream`
pub fn config_dir() -> SettingsResult<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| {
            SettingsError::ConfigDirectory("no configuration directory on this platform".into())
        })
}

/// Default location of the configuration file
pub fn default_config_path() -> SettingsResult<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load `path`, or the default config file when no path is given.
///
/// A missing default file yields the defaults; an explicitly named file
/// must exist.
pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Config::load_from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()));
    }
    let default_path = default_config_path().context("failed to locate the configuration")?;
    if !default_path.exists() {
        tracing::debug!("No configuration at {}, using defaults", default_path.display());
        return Ok(Config::default());
    }
    Config::load_from_file(&default_path)
        .with_context(|| format!("failed to load configuration from {}", default_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.connection.firmware, Firmware::Grbl);
        assert_eq!(config.connection.baud_rate, 115200);
        assert_eq!(config.streaming.status_poll_rate_ms, 200);
        assert_eq!(config.watchdog.check_interval_ms, 2000);
        assert_eq!(config.settings.timeout_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::new();
        config.connection.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.streaming.status_poll_rate_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.settings.timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("settings.timeout_ms"));

        let mut config = Config::new();
        config.streaming.buffer_size = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            firmware = "TinyG"
            port = "/dev/ttyUSB0"

            [streaming]
            single_step = true
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.firmware, Firmware::TinyG);
        assert_eq!(config.connection.baud_rate, 115200);
        assert!(config.streaming.single_step);
        assert!(config.streaming.status_poll_enabled);
        assert_eq!(config.watchdog, WatchdogSettings::default());
    }

    #[test]
    fn test_controller_config() {
        let mut config = Config::new();
        config.connection.firmware = Firmware::Marlin;
        config.streaming.buffer_size = Some(64);
        config.watchdog.enabled = false;
        config.settings.timeout_ms = 500;

        let controller = config.controller_config();
        assert_eq!(controller.firmware, Firmware::Marlin);
        assert_eq!(controller.buffer_size, Some(64));
        assert!(!controller.watchdog.enabled);
        assert_eq!(controller.settings_timeout_ms, 500);
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(matches!(
            format_for(Path::new("config.yaml")),
            Err(SettingsError::UnsupportedFormat(ext)) if ext == "yaml"
        ));
        assert!(format_for(Path::new("config")).is_err());
    }
}
