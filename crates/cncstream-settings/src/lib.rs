//! CNCStream Settings Crate
//!
//! Loads, validates and saves the configuration of the streaming engine:
//! which firmware to talk to and where, how to stream, how often to poll
//! and how long to wait for the firmware.

pub mod config;
pub mod error;

pub use config::{
    config_dir, default_config_path, load_or_default, Config, ConnectionSettings,
    StreamingSettings, SynchronizerSettings, WatchdogSettings, CONFIG_FILE_NAME,
};
pub use error::{SettingsError, SettingsResult};
