//! Controller listener interface
//!
//! Defines the listener trait for controller events. Every method has a
//! no-op default so implementors only override what they need.

use crate::core::message::MessageLevel;
use crate::data::command::Command;
use crate::data::settings::FirmwareSetting;
use crate::data::{ControlState, ControllerStatus};
use async_trait::async_trait;

/// Handle for a registered controller listener.
///
/// Uniquely identifies a listener subscription. Can be used to unsubscribe
/// from controller events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerListenerHandle(pub String);

impl ControllerListenerHandle {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Listener trait for controller events
///
/// Implement this trait to receive notifications from a controller. Calls
/// are made from the dispatcher worker, one event at a time, in the order
/// the events were produced.
#[async_trait]
pub trait ControllerListener: Send + Sync {
    /// A command was written to the transport
    async fn on_command_sent(&self, _command: &Command) {}

    /// A command was dropped without being sent
    async fn on_command_skipped(&self, _command: &Command) {}

    /// A command was acknowledged
    async fn on_command_complete(&self, _command: &Command) {}

    /// A sent or skipped command carried a comment
    async fn on_command_comment(&self, _comment: &str) {}

    /// A console message for the operator
    async fn on_console_message(&self, _level: MessageLevel, _message: &str) {}

    /// A raw line arrived from the firmware
    async fn on_raw_response(&self, _response: &str) {}

    /// A new status snapshot was parsed
    async fn on_status_changed(&self, _status: &ControllerStatus) {}

    /// The control state changed
    async fn on_state_changed(&self, _state: ControlState) {}

    /// A streaming session finished
    async fn on_stream_complete(&self, _success: bool) {}

    /// A firmware setting was read or changed
    async fn on_setting_updated(&self, _setting: &FirmwareSetting) {}
}
