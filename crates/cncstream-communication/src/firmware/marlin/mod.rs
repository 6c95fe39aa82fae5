//! Marlin support
//!
//! Marlin has no real-time commands and no status push, so it is driven as
//! a plain G-code machine: one command in flight at a time, `M114` position
//! polls on a slow timer, `M0` to pause and an out of band `M108` to
//! continue.

use crate::controller::core::ControllerCore;
use crate::firmware::{Firmware, FirmwareDialect};
use cncstream_core::{
    Capabilities, Capability, Command, ControllerState, MessageLevel, PartialPosition, Position,
    Result, Units,
};
use regex::Regex;
use std::sync::OnceLock;

/// M114 poll interval; Marlin answers slowly while moving
pub const MARLIN_POLL_INTERVAL_MS: u64 = 5000;

const MARLIN_BUFFER_SIZE: usize = 128;

const PAUSED_RESPONSE: &str = "echo:busy: paused for user";
const BUSY_RESPONSE: &str = "echo:busy: processing";
const FREE_MEMORY_RESPONSE: &str = "Free Memory:";

fn status_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^X:\s*(-?[\d.]+)\s+Y:\s*(-?[\d.]+)\s+Z:\s*(-?[\d.]+)(?:\s+E:\s*(-?[\d.]+))?")
            .expect("invalid regex pattern")
    })
}

pub fn is_ok_response(line: &str) -> bool {
    line.starts_with("ok")
}

pub fn is_paused_response(line: &str) -> bool {
    line.starts_with(PAUSED_RESPONSE)
}

pub fn is_busy_response(line: &str) -> bool {
    line.starts_with(BUSY_RESPONSE)
}

/// `M114` answer, e.g. `X:10.00 Y:0.00 Z:1.50 E:0.00 Count X:800 Y:0 Z:600`
pub fn is_status_string(line: &str) -> bool {
    status_regex().is_match(line)
}

/// Position from an `M114` answer
pub fn parse_position(line: &str) -> Option<Position> {
    let caps = status_regex().captures(line)?;
    let x = caps[1].parse().ok()?;
    let y = caps[2].parse().ok()?;
    let z = caps[3].parse().ok()?;
    Some(Position::new(x, y, z, Units::MM))
}

/// Marlin dialect
#[derive(Debug, Default)]
pub struct MarlinDialect {
    /// `M108` went out; the `paused for user` echo still in flight must
    /// not hold the queue again
    resuming: bool,
}

impl MarlinDialect {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_machine_state(&self, core: &mut ControllerCore, state_string: &str, state: ControllerState) {
        let status = core.status().clone().with_state(state_string, state);
        core.set_status(status);
    }
}

impl FirmwareDialect for MarlinDialect {
    fn firmware(&self) -> Firmware {
        Firmware::Marlin
    }

    fn buffer_size(&self) -> usize {
        MARLIN_BUFFER_SIZE
    }

    fn requires_single_step(&self) -> bool {
        true
    }

    fn holds_queue_on_pause(&self) -> bool {
        false
    }

    fn handle_response(&mut self, core: &mut ControllerCore, line: &str) -> Result<()> {
        let line = line.trim();
        if is_ok_response(line) {
            core.command_complete(line, false)?;
            self.set_machine_state(core, "Idle", ControllerState::Idle);
            self.resuming = false;
            core.console(MessageLevel::Info, line);
        } else if is_paused_response(line) {
            self.set_machine_state(core, "Paused", ControllerState::Hold);
            if !self.resuming {
                core.streamer_mut().pause();
            }
            core.console(MessageLevel::Info, line);
        } else if is_busy_response(line) {
            self.set_machine_state(core, "Run", ControllerState::Run);
            core.console(MessageLevel::Info, line);
        } else if let Some(position) = parse_position(line) {
            core.polls_mut().received();
            let status = core
                .status()
                .clone()
                .with_machine_coord(position)
                .with_work_coord(position);
            core.set_status(status);
            core.console(MessageLevel::Verbose, line);
            core.check_stream_finished();
        } else if line.contains(FREE_MEMORY_RESPONSE) {
            // Printed at the end of boot.
            self.set_machine_state(core, "Idle", ControllerState::Idle);
            core.stop_polling();
            core.begin_polling_every(MARLIN_POLL_INTERVAL_MS);
            core.console(MessageLevel::Info, line);
        } else if !line.is_empty() {
            core.console(MessageLevel::Info, line);
        }
        Ok(())
    }

    fn on_open(&mut self, core: &mut ControllerCore) -> Result<()> {
        self.resuming = false;
        core.set_capabilities(Capabilities::from_slice(&[
            Capability::XAxis,
            Capability::YAxis,
            Capability::ZAxis,
            Capability::Jogging,
            Capability::Homing,
        ]));
        core.set_firmware_version(Some("Marlin".to_string()));
        core.set_ready(true);
        core.begin_polling_every(MARLIN_POLL_INTERVAL_MS);
        Ok(())
    }

    fn before_close(&mut self, core: &mut ControllerCore) {
        core.stop_polling();
    }

    fn after_close(&mut self, core: &mut ControllerCore) {
        self.resuming = false;
        core.set_firmware_version(None);
        core.set_capabilities(Capabilities::new());
    }

    fn on_pause(&mut self, core: &mut ControllerCore) -> Result<()> {
        tracing::info!("Pausing Marlin with M0");
        core.send_command_immediately(Command::new("M0"))
    }

    fn on_resume(&mut self, core: &mut ControllerCore) -> Result<()> {
        tracing::info!("Resuming Marlin with M108");
        // M108 has to reach the firmware while M0 is still unacknowledged.
        core.streamer_mut().connection_mut().write_line("M108")?;
        self.resuming = true;
        Ok(())
    }

    fn poll_status(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_command_immediately(Command::new("M114"))
    }

    fn perform_homing_cycle(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_command_immediately(Command::new("G28"))
    }

    fn request_status_report(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_command_immediately(Command::new("M114"))
    }

    fn jog(
        &mut self,
        core: &mut ControllerCore,
        distance: &PartialPosition,
        feed_rate: f64,
    ) -> Result<()> {
        core.send_command_immediately(Command::temporary("G91"))?;
        if let Some(units) = distance.units.gcode() {
            core.send_command_immediately(Command::temporary(units))?;
        }
        let text = format!("G1 {} F{}", distance.format_gcode(), feed_rate);
        core.send_command_immediately(Command::temporary(text))?;
        core.restore_parser_modal_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_classifiers() {
        assert!(is_ok_response("ok"));
        assert!(is_ok_response("ok T:20.0 /0.0"));
        assert!(is_paused_response("echo:busy: paused for user"));
        assert!(is_busy_response("echo:busy: processing"));
        assert!(!is_busy_response("echo:Unknown command: \"X\""));
    }

    #[test]
    fn test_parse_position() {
        let line = "X:10.00 Y:-2.50 Z:1.50 E:0.00 Count X:800 Y:-200 Z:600";
        assert!(is_status_string(line));
        assert_eq!(
            parse_position(line),
            Some(Position::new(10.0, -2.5, 1.5, Units::MM))
        );
        assert_eq!(parse_position("X:1"), None);
    }

    #[test]
    fn test_dialect_flags() {
        let dialect = MarlinDialect::new();
        assert!(dialect.requires_single_step());
        assert!(!dialect.holds_queue_on_pause());
        assert_eq!(dialect.firmware(), Firmware::Marlin);
    }
}
