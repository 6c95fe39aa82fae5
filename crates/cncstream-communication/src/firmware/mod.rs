//! Firmware dialects for the supported CNC controllers
//!
//! Supported controllers:
//! - GRBL: Open-source CNC control software
//! - GrblESP32: GRBL port with up to six axes
//! - TinyG: JSON protocol CNC controller
//! - g2core: Next generation of TinyG
//! - Marlin: 3D printer firmware driven as a plain G-code machine
//! - Smoothieware: CNC control software
//!
//! Every dialect implements [`FirmwareDialect`]. The controller owns one
//! boxed dialect, chosen at connect time from [`Firmware`], and calls its
//! hooks with mutable access to the shared [`ControllerCore`].

pub mod connection_watch;
pub mod grbl;
pub mod marlin;
pub mod smoothieware;
pub mod status_poll;
pub mod tinyg;

pub use connection_watch::{ConnectionWatchConfig, ConnectionWatchState, ConnectionWatcher};
pub use status_poll::{OutstandingPolls, PollTick, StatusPoller};

use crate::communication::buffered::ExclusiveFilter;
use crate::controller::core::ControllerCore;
use cncstream_core::{
    format_coordinate, Axis, Capability, Command, ControlState, ControllerState, FirmwareError,
    Override, PartialPosition, Result, Units,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported CNC controller types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Firmware {
    /// GRBL (default, most common)
    #[default]
    Grbl,
    /// GRBL on the ESP32, with runtime axis count discovery
    GrblEsp32,
    /// TinyG
    TinyG,
    /// g2core (TinyG variant)
    G2Core,
    /// Marlin
    Marlin,
    /// Smoothieware
    Smoothie,
}

impl Firmware {
    pub const ALL: [Firmware; 6] = [
        Firmware::Grbl,
        Firmware::GrblEsp32,
        Firmware::TinyG,
        Firmware::G2Core,
        Firmware::Marlin,
        Firmware::Smoothie,
    ];

    /// Build the protocol state machine for this firmware
    pub fn create_dialect(&self) -> Box<dyn FirmwareDialect> {
        match self {
            Firmware::Grbl => Box::new(grbl::GrblDialect::new()),
            Firmware::GrblEsp32 => Box::new(grbl::GrblDialect::esp32()),
            Firmware::TinyG => Box::new(tinyg::TinyGDialect::tinyg()),
            Firmware::G2Core => Box::new(tinyg::TinyGDialect::g2core()),
            Firmware::Marlin => Box::new(marlin::MarlinDialect::new()),
            Firmware::Smoothie => Box::new(smoothieware::SmoothieDialect::new()),
        }
    }
}

impl std::fmt::Display for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grbl => write!(f, "GRBL"),
            Self::GrblEsp32 => write!(f, "GrblESP32"),
            Self::TinyG => write!(f, "TinyG"),
            Self::G2Core => write!(f, "g2core"),
            Self::Marlin => write!(f, "Marlin"),
            Self::Smoothie => write!(f, "Smoothieware"),
        }
    }
}

impl FromStr for Firmware {
    type Err = FirmwareError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grbl" => Ok(Firmware::Grbl),
            "grblesp32" | "grbl-esp32" | "esp32" => Ok(Firmware::GrblEsp32),
            "tinyg" => Ok(Firmware::TinyG),
            "g2core" | "g2" => Ok(Firmware::G2Core),
            "marlin" => Ok(Firmware::Marlin),
            "smoothie" | "smoothieware" => Ok(Firmware::Smoothie),
            other => Err(FirmwareError::UnknownFirmware {
                firmware_type: other.to_string(),
            }),
        }
    }
}

/// Error for an operation the connected firmware has no command for
pub fn not_supported(firmware: impl std::fmt::Display, command: &str) -> cncstream_core::Error {
    FirmwareError::CommandNotSupported {
        firmware: firmware.to_string(),
        command: command.to_string(),
    }
    .into()
}

/// Map a machine state to the sender's control state.
///
/// Shared by the dialects whose firmware reports a state word; GRBL layers
/// its version specific rules on top.
pub fn control_state_for(state: ControllerState, streaming: bool, paused: bool) -> ControlState {
    match state {
        ControllerState::Jog | ControllerState::Run => ControlState::Sending,
        ControllerState::Hold | ControllerState::Door => ControlState::SendingPaused,
        ControllerState::Idle if streaming => ControlState::SendingPaused,
        ControllerState::Idle => ControlState::Idle,
        ControllerState::Alarm => ControlState::Idle,
        ControllerState::Check if streaming && paused => ControlState::SendingPaused,
        ControllerState::Check if streaming => ControlState::Sending,
        ControllerState::Check => ControlState::Check,
        _ => ControlState::Idle,
    }
}

/// Relative move with ordinary G-code, e.g. `G91 G21 G1 X10.0000 F500`
pub fn relative_move_command(distance: &PartialPosition, feed_rate: f64) -> String {
    let mut parts = vec!["G91".to_string()];
    if let Some(units) = distance.units.gcode() {
        parts.push(units.to_string());
    }
    parts.push("G1".to_string());
    parts.push(distance.format_gcode());
    parts.push(format!("F{}", feed_rate));
    parts.join(" ")
}

/// Straight probe toward the workpiece along one axis, in millimeters
pub fn probe_command(axis: Axis, distance: f64, feed_rate: f64, units: Units) -> String {
    let scale = Units::convert(1.0, units, Units::MM);
    format!(
        "G38.2 {}{} F{}",
        axis,
        format_coordinate(distance * scale),
        format_coordinate(feed_rate * scale)
    )
}

/// Dynamic tool length offset along one axis, in millimeters
pub fn tool_offset_command(axis: Axis, offset: f64, units: Units) -> String {
    let scale = Units::convert(1.0, units, Units::MM);
    format!("G43.1 {}{}", axis, format_coordinate(offset * scale))
}

/// Jog with ordinary G-code, restoring the modal state afterwards
pub fn default_jog<D: FirmwareDialect + ?Sized>(
    dialect: &D,
    core: &mut ControllerCore,
    distance: &PartialPosition,
    feed_rate: f64,
) -> Result<()> {
    if !core.capabilities().has(Capability::Jogging) {
        return Err(not_supported(dialect.firmware(), "jogging"));
    }
    let command = Command::temporary(relative_move_command(distance, feed_rate));
    core.send_command_immediately(command)?;
    core.restore_parser_modal_state()
}

/// Protocol state machine for one firmware family.
///
/// Hooks receive the shared controller core. Operations a firmware has no
/// command for keep the default body, which reports a capability gap.
pub trait FirmwareDialect: Send {
    fn firmware(&self) -> Firmware;

    /// Receive buffer size of the firmware in bytes
    fn buffer_size(&self) -> usize;

    /// Whether the streamer must send one command at a time
    fn requires_single_step(&self) -> bool {
        false
    }

    /// Marks commands that must be the only command in flight
    fn exclusive_filter(&self) -> Option<ExclusiveFilter> {
        None
    }

    /// Handle one inbound line
    fn handle_response(&mut self, core: &mut ControllerCore, line: &str) -> Result<()>;

    /// Called after the transport opened
    fn on_open(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Ok(())
    }

    /// Called before the transport closes
    fn before_close(&mut self, _core: &mut ControllerCore) {}

    /// Called after the transport closed
    fn after_close(&mut self, _core: &mut ControllerCore) {}

    /// Extra preconditions for starting a stream
    fn check_ready_to_stream(&self, _core: &ControllerCore) -> Result<()> {
        Ok(())
    }

    fn before_cancel(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Ok(())
    }

    fn after_cancel(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Ok(())
    }

    fn on_pause(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Ok(())
    }

    fn on_resume(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Ok(())
    }

    /// Whether pausing a stream holds the send queue right away. Firmware
    /// that pauses through an in-band command holds it once it reports the
    /// pause instead.
    fn holds_queue_on_pause(&self) -> bool {
        true
    }

    /// Send one status request for the poll timer
    fn poll_status(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Ok(())
    }

    /// The status poll rate changed
    fn on_status_rate_changed(&mut self, _core: &mut ControllerCore) {}

    fn perform_homing_cycle(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Err(not_supported(self.firmware(), "homing"))
    }

    /// Raise Z to zero if below it, move to X0 Y0, then lower to Z0
    fn return_to_home(&mut self, core: &mut ControllerCore) -> Result<()> {
        if core.status().work_coord.z < 0.0 {
            core.send_command_immediately(Command::new("G90 G0 Z0"))?;
        }
        core.send_command_immediately(Command::new("G90 G0 X0 Y0"))?;
        core.send_command_immediately(Command::new("G90 G0 Z0"))
    }

    fn set_work_position(
        &mut self,
        _core: &mut ControllerCore,
        _position: &PartialPosition,
    ) -> Result<()> {
        Err(not_supported(self.firmware(), "set work position"))
    }

    fn reset_coordinates_to_zero(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Err(not_supported(self.firmware(), "reset coordinates to zero"))
    }

    fn kill_alarm_lock(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Err(not_supported(self.firmware(), "kill alarm lock"))
    }

    fn toggle_check_mode(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Err(not_supported(self.firmware(), "check mode"))
    }

    fn view_parser_state(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Err(not_supported(self.firmware(), "view parser state"))
    }

    fn request_status_report(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Err(not_supported(self.firmware(), "status report"))
    }

    fn soft_reset(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Err(not_supported(self.firmware(), "soft reset"))
    }

    fn send_override(&mut self, _core: &mut ControllerCore, command: Override) -> Result<()> {
        Err(FirmwareError::UnsupportedFeature {
            firmware: self.firmware().to_string(),
            feature: format!("override ({})", command),
        }
        .into())
    }

    /// Relative jog. The default sends a temporary `G91 G1` move and then
    /// puts the parser back in the operator's distance mode and units.
    fn jog(
        &mut self,
        core: &mut ControllerCore,
        distance: &PartialPosition,
        feed_rate: f64,
    ) -> Result<()> {
        default_jog(&*self, core, distance, feed_rate)
    }

    /// Probe along `axis` for at most `distance`: metric incremental moves
    /// with no tool length offset, then the operator's modal state again
    fn probe(
        &mut self,
        core: &mut ControllerCore,
        axis: Axis,
        distance: f64,
        feed_rate: f64,
        units: Units,
    ) -> Result<()> {
        tracing::info!("Probing {} for {}", axis, distance);
        core.send_command_immediately(Command::temporary("G21 G91 G49"))?;
        core.send_command_immediately(Command::temporary(probe_command(
            axis, distance, feed_rate, units,
        )))?;
        core.restore_parser_modal_state()
    }

    /// Apply a tool length offset along `axis`
    fn offset_tool(
        &mut self,
        core: &mut ControllerCore,
        axis: Axis,
        offset: f64,
        units: Units,
    ) -> Result<()> {
        tracing::info!("Tool offset {} {}", axis, offset);
        core.send_command_immediately(Command::temporary("G21 G90"))?;
        core.send_command_immediately(Command::new(tool_offset_command(axis, offset, units)))?;
        core.restore_parser_modal_state()
    }

    /// The command that assigns a firmware setting
    fn setting_command(&self, key: &str, _value: &str) -> Result<String> {
        Err(FirmwareError::UnsupportedFeature {
            firmware: self.firmware().to_string(),
            feature: format!("writing setting {}", key),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_from_str() {
        assert_eq!("grbl".parse::<Firmware>().unwrap(), Firmware::Grbl);
        assert_eq!("G2Core".parse::<Firmware>().unwrap(), Firmware::G2Core);
        assert_eq!(
            "smoothieware".parse::<Firmware>().unwrap(),
            Firmware::Smoothie
        );
        assert!("mach3".parse::<Firmware>().is_err());
        for firmware in Firmware::ALL {
            assert_eq!(firmware.create_dialect().firmware(), firmware);
        }
    }

    #[test]
    fn test_control_state_mapping() {
        use ControllerState::*;
        assert_eq!(control_state_for(Run, false, false), ControlState::Sending);
        assert_eq!(control_state_for(Hold, true, false), ControlState::SendingPaused);
        assert_eq!(control_state_for(Idle, true, false), ControlState::SendingPaused);
        assert_eq!(control_state_for(Idle, false, false), ControlState::Idle);
        assert_eq!(control_state_for(Check, true, true), ControlState::SendingPaused);
        assert_eq!(control_state_for(Check, true, false), ControlState::Sending);
        assert_eq!(control_state_for(Check, false, false), ControlState::Check);
        assert_eq!(control_state_for(Alarm, true, false), ControlState::Idle);
    }

    #[test]
    fn test_relative_move_command() {
        let distance = PartialPosition::axis(Axis::X, 10.0, Units::MM).with(Axis::Z, -1.5);
        assert_eq!(
            relative_move_command(&distance, 500.0),
            "G91 G21 G1 X10.0000 Z-1.5000 F500"
        );
    }

    #[test]
    fn test_probe_and_offset_commands() {
        assert_eq!(
            probe_command(Axis::Z, -10.0, 100.0, Units::MM),
            "G38.2 Z-10.0000 F100.0000"
        );
        assert_eq!(
            probe_command(Axis::Z, -0.5, 4.0, Units::INCH),
            "G38.2 Z-12.7000 F101.6000"
        );
        assert_eq!(
            tool_offset_command(Axis::Z, 1.25, Units::MM),
            "G43.1 Z1.2500"
        );
    }
}
