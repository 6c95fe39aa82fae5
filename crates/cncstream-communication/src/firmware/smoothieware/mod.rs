//! Smoothieware support
//!
//! Smoothieware speaks a GRBL flavoured protocol: `ok`/`error` acks,
//! `<...>` status reports answered to `?`, `[...]` parser state and the
//! `!`/`~` real-time bytes. The boot handshake differs: the board prints
//! `Smoothie` then `ok`, and the sender asks for `version` to learn the
//! build before it starts polling.

use crate::controller::core::ControllerCore;
use crate::firmware::grbl::status_parser::parse_status;
use crate::firmware::{control_state_for, Firmware, FirmwareDialect};
use cncstream_core::{
    Capabilities, Capability, Command, ControlState, ControllerError, ControllerState,
    MessageLevel, PartialPosition, Result, Units,
};

pub const SMOOTHIE_STATUS_COMMAND: u8 = b'?';
pub const SMOOTHIE_PAUSE_COMMAND: u8 = b'!';
pub const SMOOTHIE_RESUME_COMMAND: u8 = b'~';
pub const SMOOTHIE_RESET_COMMAND: u8 = 0x18;

const SMOOTHIE_BUFFER_SIZE: usize = 128;

const VERSION_PREFIX: &str = "Build version:";

/// Build name from `Build version: edge-94de12c, Build date: ...`
pub fn parse_build_version(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix(VERSION_PREFIX)?;
    let version = rest.split(',').next()?.trim();
    (!version.is_empty()).then_some(version)
}

pub fn is_status_response(line: &str) -> bool {
    line.starts_with('<') && line.ends_with('>')
}

/// Inner text of a `[G0 G54 G17 ...]` parser state line
pub fn parser_state(line: &str) -> Option<&str> {
    line.strip_prefix('[')?.strip_suffix(']')
}

/// Smoothieware dialect
#[derive(Debug, Default)]
pub struct SmoothieDialect {
    /// The `Smoothie` banner was printed
    banner_seen: bool,
    version_requested: bool,
}

impl SmoothieDialect {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_version(&mut self, core: &mut ControllerCore, line: &str, version: &str) -> Result<()> {
        core.console(MessageLevel::Info, line);
        core.set_firmware_version(Some(format!("Smoothie {}", version)));
        core.set_capabilities(Capabilities::from_slice(&[
            Capability::XAxis,
            Capability::YAxis,
            Capability::ZAxis,
            Capability::Jogging,
            Capability::Homing,
            Capability::ReturnToZero,
        ]));
        let status = core.status().clone().with_state("Idle", ControllerState::Idle);
        core.set_status(status);
        core.set_control_state(ControlState::Idle);
        core.set_ready(true);
        core.queue_and_send(Command::new("$G"))?;
        core.begin_polling();
        Ok(())
    }

    fn handle_status(&mut self, core: &mut ControllerCore, line: &str) {
        core.polls_mut().received();
        core.console(MessageLevel::Verbose, line);
        let units = core.modal().units();
        let previous = core.status().clone();
        let Some(status) = parse_status(Some(&previous), line, line.contains('|'), units) else {
            return;
        };
        let before = previous.state;
        let after = status.state;
        core.set_status(status);
        if before != after {
            let control = control_state_for(after, core.is_streaming(), core.is_paused());
            core.set_control_state(control);
        }
    }

    fn set_machine_state(&self, core: &mut ControllerCore, state: ControllerState) {
        let status = core.status().clone().with_state(state.to_string(), state);
        core.set_status(status);
    }
}

impl FirmwareDialect for SmoothieDialect {
    fn firmware(&self) -> Firmware {
        Firmware::Smoothie
    }

    fn buffer_size(&self) -> usize {
        SMOOTHIE_BUFFER_SIZE
    }

    fn handle_response(&mut self, core: &mut ControllerCore, line: &str) -> Result<()> {
        let line = line.trim();

        if !self.banner_seen && line.eq_ignore_ascii_case("smoothie") {
            self.banner_seen = true;
            core.console(MessageLevel::Info, line);
            return Ok(());
        }
        if self.banner_seen
            && !core.is_ready()
            && !self.version_requested
            && line.eq_ignore_ascii_case("ok")
        {
            self.version_requested = true;
            return core.queue_and_send(Command::new("version"));
        }
        if let Some(version) = parse_build_version(line) {
            return self.handle_version(core, line, version);
        }

        if line.eq_ignore_ascii_case("ok") || line.starts_with("ok ") {
            core.command_complete(line, false)
        } else if line.starts_with("error") {
            core.console(MessageLevel::Error, line);
            core.command_complete(line, true)
        } else if is_status_response(line) {
            self.handle_status(core, line);
            core.check_stream_finished();
            Ok(())
        } else if let Some(state) = parser_state(line) {
            core.console(MessageLevel::Info, line);
            core.modal_mut().update(state);
            Ok(())
        } else {
            core.console(MessageLevel::Info, line);
            Ok(())
        }
    }

    fn on_open(&mut self, core: &mut ControllerCore) -> Result<()> {
        self.banner_seen = false;
        self.version_requested = false;
        core.set_ready(false);
        Ok(())
    }

    fn before_close(&mut self, core: &mut ControllerCore) {
        core.stop_polling();
    }

    fn after_close(&mut self, core: &mut ControllerCore) {
        self.banner_seen = false;
        self.version_requested = false;
        core.set_firmware_version(None);
        core.set_capabilities(Capabilities::new());
    }

    fn check_ready_to_stream(&self, core: &ControllerCore) -> Result<()> {
        if core.status().state == ControllerState::Alarm {
            return Err(ControllerError::Alarm {
                message: "Machine is in an alarm state, unlock it before streaming".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn before_cancel(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.streamer_mut().cancel();
        core.send_byte(SMOOTHIE_RESET_COMMAND)
    }

    fn on_pause(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_byte(SMOOTHIE_PAUSE_COMMAND)
    }

    fn on_resume(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_byte(SMOOTHIE_RESUME_COMMAND)
    }

    fn poll_status(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_byte(SMOOTHIE_STATUS_COMMAND)
    }

    fn on_status_rate_changed(&mut self, core: &mut ControllerCore) {
        if core.is_polling() {
            core.restart_polling();
        }
    }

    fn perform_homing_cycle(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_command_immediately(Command::new("$H"))?;
        self.set_machine_state(core, ControllerState::Home);
        Ok(())
    }

    fn set_work_position(
        &mut self,
        core: &mut ControllerCore,
        position: &PartialPosition,
    ) -> Result<()> {
        let text = format!(
            "G10 L20 P{} {}",
            core.modal().coordinate_index(),
            position.format_gcode()
        );
        core.send_command_immediately(Command::new(text))
    }

    fn reset_coordinates_to_zero(&mut self, core: &mut ControllerCore) -> Result<()> {
        let zero = PartialPosition::xyz(0.0, 0.0, 0.0, Units::MM);
        self.set_work_position(core, &zero)
    }

    fn kill_alarm_lock(&mut self, core: &mut ControllerCore) -> Result<()> {
        if core.status().state != ControllerState::Alarm {
            return Err(ControllerError::InvalidState {
                reason: "The unlock command may only be sent in the Alarm state".to_string(),
            }
            .into());
        }
        core.send_command_immediately(Command::new("$X"))
    }

    fn view_parser_state(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.queue_and_send(Command::new("$G"))
    }

    fn request_status_report(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_byte(SMOOTHIE_STATUS_COMMAND)
    }

    fn soft_reset(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.streamer_mut().cancel();
        core.send_byte(SMOOTHIE_RESET_COMMAND)?;
        core.set_control_state(ControlState::Disconnected);
        self.set_machine_state(core, ControllerState::Disconnected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_version() {
        assert_eq!(
            parse_build_version(
                "Build version: edge-94de12c, Build date: Oct 28 2014 13:24:47, MCU: LPC1769"
            ),
            Some("edge-94de12c")
        );
        assert_eq!(parse_build_version("Build version: , Build date:"), None);
        assert_eq!(parse_build_version("ok"), None);
    }

    #[test]
    fn test_line_classifiers() {
        assert!(is_status_response("<Idle|MPos:0.0000,0.0000,0.0000|WPos:0.0000,0.0000,0.0000>"));
        assert!(!is_status_response("[G0 G54]"));
        assert_eq!(parser_state("[G0 G54 G17 G21 G90]"), Some("G0 G54 G17 G21 G90"));
        assert_eq!(parser_state("ok"), None);
    }

    #[test]
    fn test_identity() {
        let dialect = SmoothieDialect::new();
        assert_eq!(dialect.firmware(), Firmware::Smoothie);
        assert!(dialect.holds_queue_on_pause());
        assert!(dialect.exclusive_filter().is_none());
    }
}
