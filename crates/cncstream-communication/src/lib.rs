//! # CNCStream Communication
//!
//! Transport, flow-controlled streaming and firmware protocol support for
//! CNCStream. Drives GRBL, GrblESP32, TinyG, g2core, Marlin and
//! Smoothieware controllers over a serial port or an in-memory loopback.

pub mod communication;
pub mod controller;
pub mod firmware;

pub use communication::{
    buffered::{BufferedStreamer, StreamerConfig, StreamerEvent},
    loopback::{LoopbackConnection, LoopbackHandle},
    serial::{SerialConnection, SerialOptions},
    source::{CommandSource, FileSource, LineSource},
    Connection, LineAssembler, ResponseSink,
};

pub use controller::{
    Controller, ControllerConfig, ControllerCore, DistanceMode, ModalState, PollConfig, RowCounts,
};

pub use firmware::{
    grbl::GrblSettings, ConnectionWatchConfig, ConnectionWatchState, ConnectionWatcher, Firmware,
    FirmwareDialect,
};
