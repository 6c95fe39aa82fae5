//! Error handling for CNCStream
//!
//! Provides error types for each layer of the protocol engine:
//! - Controller errors (preconditions, protocol state)
//! - Connection errors (transport and flow-control failures)
//! - Firmware errors (capability gaps, settings, parsing)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Controller error type
///
/// Represents precondition failures and protocol-state violations raised by
/// the controller state machine. None of these mutate controller state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// Controller is not connected
    #[error("Controller not connected")]
    NotConnected,

    /// Controller is already connected
    #[error("Controller already connected")]
    AlreadyConnected,

    /// Firmware has not finished booting
    #[error("Controller is still booting, commands cannot be sent yet")]
    NotReady,

    /// A stream is already running
    #[error("Already streaming")]
    AlreadyStreaming,

    /// Commands are still waiting for an acknowledgment
    #[error("Cannot stream while there are active commands: {summary}")]
    ActiveCommandsOutstanding {
        /// Comma separated list of the outstanding commands.
        summary: String,
    },

    /// Nothing has been queued for streaming
    #[error("There are no commands queued for streaming")]
    NothingQueued,

    /// An acknowledgment arrived with no command outstanding
    #[error("Unexpected response with no active command: {response}")]
    UnexpectedResponse {
        /// The response line that could not be matched.
        response: String,
    },

    /// Machine is in an alarm state
    #[error("Alarm: {message}")]
    Alarm {
        /// The decoded alarm message.
        message: String,
    },

    /// Controller operation timed out
    #[error("Controller operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Command was rejected by controller
    #[error("Command rejected: {reason}")]
    CommandRejected {
        /// The reason the command was rejected.
        reason: String,
    },

    /// Operation is not valid in the current state
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Why the operation is not allowed.
        reason: String,
    },

    /// Generic controller error
    #[error("Controller error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Connection error type
///
/// Represents errors raised by the transport underneath the streamer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// The transport is not open
    #[error("Connection is not open")]
    NotOpen,

    /// A write failed part way through a stream. Buffer accounting can no
    /// longer be trusted after this.
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// The reason for the write failure.
        reason: String,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Generic connection error
    #[error("Connection error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Firmware error type
///
/// Represents errors specific to a firmware dialect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FirmwareError {
    /// Unknown firmware type
    #[error("Unknown firmware type: {firmware_type}")]
    UnknownFirmware {
        /// The unknown firmware type identifier.
        firmware_type: String,
    },

    /// Unsupported feature
    #[error("Feature not supported by {firmware}: {feature}")]
    UnsupportedFeature {
        /// The firmware that does not support the feature.
        firmware: String,
        /// The unsupported feature name.
        feature: String,
    },

    /// Command not supported by firmware
    #[error("Command not supported by {firmware}: {command}")]
    CommandNotSupported {
        /// The firmware that does not support the command.
        firmware: String,
        /// The operation that has no command for this firmware.
        command: String,
    },

    /// Settings not available
    #[error("Setting {setting} not available")]
    SettingNotAvailable {
        /// The setting that is not available.
        setting: String,
    },

    /// Another setting update has not finished yet
    #[error("Setting update already in progress for {setting}")]
    SettingUpdateInProgress {
        /// The setting currently being written.
        setting: String,
    },

    /// Firmware replied with an error to a setting assignment
    #[error("Firmware rejected {setting}: {response}")]
    SettingRejected {
        /// The setting that was rejected.
        setting: String,
        /// The error line returned by the firmware.
        response: String,
    },

    /// Invalid setting value
    #[error("Invalid setting value for {setting}: {reason}")]
    InvalidSettingValue {
        /// The setting with the invalid value.
        setting: String,
        /// The reason the value is invalid.
        reason: String,
    },

    /// Response parsing error
    #[error("Failed to parse firmware response: {reason}")]
    ResponseParseError {
        /// The reason the response parsing failed.
        reason: String,
    },
}

/// Main error type for CNCStream
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Firmware error
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Controller(ControllerError::Timeout { .. }))
    }

    /// Check if this is a capability gap rather than a protocol error
    pub fn is_not_supported(&self) -> bool {
        matches!(
            self,
            Error::Firmware(
                FirmwareError::UnsupportedFeature { .. } | FirmwareError::CommandNotSupported { .. }
            )
        )
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a controller error
    pub fn is_controller_error(&self) -> bool {
        matches!(self, Error::Controller(_))
    }

    /// Check if this is a firmware error
    pub fn is_firmware_error(&self) -> bool {
        matches!(self, Error::Firmware(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_helpers() {
        let timeout: Error = ControllerError::Timeout { timeout_ms: 2000 }.into();
        assert!(timeout.is_timeout());
        assert!(timeout.is_controller_error());
        assert!(!timeout.is_not_supported());

        let gap: Error = FirmwareError::CommandNotSupported {
            firmware: "GRBL 0.7".to_string(),
            command: "homing".to_string(),
        }
        .into();
        assert!(gap.is_not_supported());
        assert!(gap.is_firmware_error());

        let lost: Error = ConnectionError::NotOpen.into();
        assert!(lost.is_connection_error());
    }

    #[test]
    fn test_display_messages() {
        let err = ControllerError::ActiveCommandsOutstanding {
            summary: "G0 X1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot stream while there are active commands: G0 X1"
        );

        let err: Error = FirmwareError::SettingRejected {
            setting: "$13".to_string(),
            response: "error:3".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Firmware rejected $13: error:3");
    }
}
