//! # CNCStream
//!
//! A flow-controlled G-code streaming engine for CNC controllers with support for:
//! - GRBL, GrblESP32, TinyG, g2core, Marlin and Smoothieware firmware
//! - Character-counting flow control against the firmware receive buffer
//! - Status polling, connection watchdog and firmware setting writes
//!
//! ## Architecture
//!
//! CNCStream is organized as a workspace with multiple crates:
//!
//! 1. **cncstream-core** - Commands, machine status, errors, ordered event dispatch
//! 2. **cncstream-communication** - Transports, streamer, firmware dialects, controller
//! 3. **cncstream-settings** - Configuration files
//! 4. **cncstream** - This facade plus the `cncstream` command-line sender

pub mod cli;

pub use cncstream_core::{
    Capabilities, Capability, Command, ConnectionError, ControlState, ControllerError,
    ControllerEvent, ControllerListener, ControllerListenerHandle, ControllerState,
    ControllerStatus, Error, FirmwareError, FirmwareSetting, MessageLevel, Override,
    PartialPosition, Position, Result, Units,
};

pub use cncstream_communication::{
    CommandSource, Connection, Controller, ControllerConfig, FileSource, Firmware, LineSource,
    LoopbackConnection, LoopbackHandle, RowCounts, SerialConnection,
};

pub use cncstream_settings::{Config, SettingsError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging
///
/// Sets up structured logging on stderr with:
/// - RUST_LOG environment variable support (default `info`)
/// - target, level, thread ids and line numbers
/// - JSON lines instead of human-readable output when `json` is set
///
/// Stdout is left to the console messages of the controller.
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}
