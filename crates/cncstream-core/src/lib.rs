//! # CNCStream Core
//!
//! Core types, events and error handling for the CNCStream protocol engine.
//! Provides the data model shared by the streamer, the firmware dialects and
//! the controller, plus the ordered event dispatcher that delivers controller
//! events to listeners.

pub mod core;
pub mod data;
pub mod error;

pub use core::{
    event::{ControllerEvent, EventDispatcher},
    listener::{ControllerListener, ControllerListenerHandle},
    message::MessageLevel,
};

pub use data::{
    capabilities::{Capabilities, Capability},
    command::{Command, CommandNumberGenerator, CommandState},
    overrides::Override,
    settings::{FirmwareSetting, FirmwareSettingsStore},
    format_coordinate, AccessoryStates, Axis, ControlState, ControllerState, ControllerStatus,
    EnabledPins, OverridePercents, PartialPosition, Position, Units,
};

pub use error::{ConnectionError, ControllerError, Error, FirmwareError, Result};
