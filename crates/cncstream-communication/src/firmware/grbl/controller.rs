//! GRBL protocol state machine
//!
//! Handles the GRBL response stream: command acknowledgments, errors and
//! alarms, the welcome line printed after every reset, status reports,
//! probe results, parser-state feedback and `$n=` setting lines. Also
//! synthesizes the version specific commands for homing, coordinate
//! offsets, jogging and overrides.

use super::error_decoder::{describe_alarm_line, describe_error_line};
use super::settings::{describe_setting, setting_command, GrblSettings};
use super::status_parser::{parse_probe, parse_status};
use super::utils::*;
use crate::communication::buffered::ExclusiveFilter;
use crate::controller::core::ControllerCore;
use crate::firmware::{control_state_for, not_supported, Firmware, FirmwareDialect};
use cncstream_core::{
    Axis, Capabilities, Capability, Command, ControlState, ControllerError, ControllerEvent,
    ControllerState, ControllerStatus, MessageLevel, Override, PartialPosition, Position, Result,
};
use regex::Regex;
use std::sync::OnceLock;

/// Status reports allowed while waiting for a cancel to settle
const CANCEL_ATTEMPTS: u32 = 50;

fn axis_count_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[MSG:\s*Axis count (\d+)\]$").expect("invalid regex pattern"))
}

/// GRBL and GrblESP32 dialect
#[derive(Debug)]
pub struct GrblDialect {
    esp32: bool,
    version: Option<GrblVersion>,
    /// Axis count announced by GrblESP32 during boot
    axis_count: Option<usize>,
    canceling: bool,
    cancel_attempts: u32,
    cancel_last_position: Option<Position>,
    /// Single-step setting to restore when check mode ends
    saved_single_step: Option<bool>,
}

impl GrblDialect {
    pub fn new() -> Self {
        Self {
            esp32: false,
            version: None,
            axis_count: None,
            canceling: false,
            cancel_attempts: 0,
            cancel_last_position: None,
            saved_single_step: None,
        }
    }

    /// GrblESP32 variant, which announces its axis count
    pub fn esp32() -> Self {
        Self {
            esp32: true,
            ..Self::new()
        }
    }

    pub fn version(&self) -> Option<GrblVersion> {
        self.version
    }

    fn booted_version(&self) -> Result<GrblVersion> {
        self.version.ok_or_else(|| ControllerError::NotReady.into())
    }

    fn require_real_time(&self, core: &ControllerCore, operation: &str) -> Result<()> {
        if core.capabilities().has(Capability::RealTime) {
            Ok(())
        } else {
            Err(not_supported(self.firmware_label(), operation))
        }
    }

    fn firmware_label(&self) -> String {
        match self.version {
            Some(v) => format!("{} {}", self.firmware(), v),
            None => self.firmware().to_string(),
        }
    }

    fn v1_format(core: &ControllerCore) -> bool {
        core.capabilities().has(Capability::V1Format)
    }

    fn handle_error(&mut self, core: &mut ControllerCore, line: &str) -> Result<()> {
        let decoded = describe_error_line(line);
        match core.active_command() {
            Some(active) => {
                let message = format!(
                    "An error was detected while sending '{}': {}",
                    active.text, decoded
                );
                core.console(MessageLevel::Error, message);
                core.command_complete(line, true)
            }
            None => {
                core.console(
                    MessageLevel::Error,
                    format!("An unexpected error was detected: {}", decoded),
                );
                Ok(())
            }
        }
    }

    fn handle_alarm(&mut self, core: &mut ControllerCore, line: &str) -> Result<()> {
        core.console(MessageLevel::Error, describe_alarm_line(line));
        let status = core
            .status()
            .clone()
            .with_state("Alarm", ControllerState::Alarm);
        core.set_status(status);
        if core.active_command().is_some() {
            core.command_complete(line, true)?;
        }
        core.set_control_state(ControlState::Idle);
        Ok(())
    }

    fn handle_version(&mut self, core: &mut ControllerCore, line: &str) -> Result<()> {
        let Some(version) = GrblVersion::parse(line) else {
            return Ok(());
        };
        tracing::info!("{} version {} detected", self.firmware(), version);

        core.set_ready(true);
        core.reset_buffers();
        self.canceling = false;
        self.cancel_last_position = None;

        let mut capabilities = capabilities_for(&version);
        if let Some(count) = self.axis_count {
            apply_axis_count(&mut capabilities, count);
        }
        self.version = Some(version);
        core.set_firmware_version(Some(format!("{} {}", self.firmware(), version)));
        core.set_capabilities(capabilities);
        core.console(MessageLevel::Info, format!("Grbl version = {}", version));

        if core.status().state != ControllerState::Check {
            let units = GrblSettings::new(core.settings()).reporting_units();
            core.set_status(ControllerStatus::new(ControllerState::Unknown, units));
        }
        if core.is_streaming() {
            core.console(
                MessageLevel::Error,
                "**** The controller was reset, stream aborted ****",
            );
            core.end_stream();
            core.publish(ControllerEvent::StreamComplete { success: false });
        }
        core.set_control_state(ControlState::Idle);

        if core.capabilities().has(Capability::RealTime) {
            core.restart_polling();
        } else {
            core.stop_polling();
        }

        core.send_command_immediately(Command::new("$$"))?;
        if version.has_system_commands() {
            core.send_command_immediately(Command::new("$G"))?;
        }
        Ok(())
    }

    fn handle_probe(&mut self, core: &mut ControllerCore, line: &str) {
        core.console(MessageLevel::Info, line);
        let units = GrblSettings::new(core.settings()).reporting_units();
        match parse_probe(line, units) {
            Some((position, true)) => core.set_probe_position(position),
            Some((_, false)) => tracing::debug!("Probe did not make contact"),
            None => tracing::warn!("Malformed probe report: {}", line),
        }
    }

    fn handle_status(&mut self, core: &mut ControllerCore, line: &str) -> Result<()> {
        core.polls_mut().received();
        let units = GrblSettings::new(core.settings()).reporting_units();
        let previous = core.status().clone();
        let Some(status) = parse_status(Some(&previous), line, Self::v1_format(core), units) else {
            core.console(MessageLevel::Info, line);
            return Ok(());
        };
        core.console(MessageLevel::Verbose, line);

        let before = previous.state;
        let after = status.state;
        core.set_status(status);

        if after == ControllerState::Check && before != ControllerState::Check {
            self.saved_single_step = Some(core.streamer().single_step());
            core.streamer_mut().set_single_step(true);
        } else if before == ControllerState::Check && after != ControllerState::Check {
            if let Some(single_step) = self.saved_single_step.take() {
                core.streamer_mut().set_single_step(single_step);
            }
        }

        if after.ends_jog(before) {
            tracing::debug!("Jog ended ({} -> {}), dropping queued jog commands", before, after);
            core.streamer_mut().cancel();
        }

        if after != before {
            let control = control_state_for(after, core.is_streaming(), core.is_paused());
            core.set_control_state(control);
        }

        self.check_cancel(core)
    }

    /// After a cancel, wait for the machine to stop. A machine stuck in a
    /// feed hold gets a soft reset to flush its planner.
    fn check_cancel(&mut self, core: &mut ControllerCore) -> Result<()> {
        if !self.canceling {
            return Ok(());
        }
        let state = core.status().state;
        let position = core.status().machine_coord;
        if self.cancel_attempts > 0 {
            if let Some(last) = self.cancel_last_position {
                self.cancel_attempts -= 1;
                if matches!(state, ControllerState::Idle | ControllerState::Check) {
                    self.canceling = false;
                } else if matches!(state, ControllerState::Hold | ControllerState::Door)
                    && last == position
                {
                    self.canceling = false;
                    core.streamer_mut().cancel();
                    core.send_byte(GRBL_RESET_COMMAND)?;
                }
                if self.canceling && self.cancel_attempts == 0 {
                    self.canceling = false;
                    core.console(
                        MessageLevel::Error,
                        "Unable to cancel the current job, try using soft reset",
                    );
                }
            }
        }
        self.cancel_last_position = Some(position);
        Ok(())
    }

    fn handle_feedback(&mut self, core: &mut ControllerCore, line: &str) {
        if self.esp32 {
            if let Some(count) = axis_count_regex()
                .captures(line)
                .and_then(|caps| caps[1].parse::<usize>().ok())
            {
                self.axis_count = Some(count);
                apply_axis_count(core.capabilities_mut(), count);
                core.console(MessageLevel::Info, line);
                return;
            }
        }
        match parse_feedback_modal_state(line, Self::v1_format(core)) {
            Some(modal) => {
                core.modal_mut().update(modal);
                core.console(MessageLevel::Verbose, line);
            }
            None => core.console(MessageLevel::Info, line),
        }
    }
}

impl Default for GrblDialect {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace the axis capabilities with the first `count` axes
fn apply_axis_count(capabilities: &mut Capabilities, count: usize) {
    for (index, axis) in Axis::ALL.iter().enumerate() {
        let capability = Capability::for_axis(*axis);
        if index < count {
            capabilities.add(capability);
        } else {
            capabilities.remove(capability);
        }
    }
}

impl FirmwareDialect for GrblDialect {
    fn firmware(&self) -> Firmware {
        if self.esp32 {
            Firmware::GrblEsp32
        } else {
            Firmware::Grbl
        }
    }

    fn buffer_size(&self) -> usize {
        GRBL_RX_BUFFER_SIZE
    }

    fn exclusive_filter(&self) -> Option<ExclusiveFilter> {
        Some(is_exclusive_command)
    }

    fn handle_response(&mut self, core: &mut ControllerCore, line: &str) -> Result<()> {
        let line = line.trim();
        if is_ok_response(line) {
            core.command_complete(line, false)
        } else if is_error_response(line) {
            self.handle_error(core, line)
        } else if is_alarm_response(line) {
            self.handle_alarm(core, line)
        } else if is_version_string(line) {
            self.handle_version(core, line)
        } else if is_probe_message(line) {
            self.handle_probe(core, line);
            Ok(())
        } else if is_status_string(line) {
            self.handle_status(core, line)
        } else if is_feedback_message(line) {
            self.handle_feedback(core, line);
            Ok(())
        } else if let Some((key, value)) = parse_setting_line(line) {
            core.console(MessageLevel::Info, line);
            core.update_setting(describe_setting(&key, &value));
            Ok(())
        } else {
            core.console(MessageLevel::Info, line);
            Ok(())
        }
    }

    fn on_open(&mut self, core: &mut ControllerCore) -> Result<()> {
        self.version = None;
        core.set_ready(false);
        // The welcome line printed after the reset completes the handshake.
        core.send_byte(GRBL_RESET_COMMAND)
    }

    fn before_close(&mut self, core: &mut ControllerCore) {
        core.stop_polling();
    }

    fn after_close(&mut self, core: &mut ControllerCore) {
        self.version = None;
        self.canceling = false;
        self.saved_single_step = None;
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
        let real_time = core.capabilities().has(Capability::RealTime);
        let paused = core.is_paused();
        if paused && !real_time {
            return Err(ControllerError::InvalidState {
                reason: "Cannot cancel while paused with this version of GRBL. Reconnect to reset GRBL."
                    .to_string(),
            }
            .into());
        }
        if !paused && real_time {
            if core.status().state == ControllerState::Jog {
                core.send_byte(GRBL_JOG_CANCEL_COMMAND)?;
            } else {
                core.send_byte(GRBL_PAUSE_COMMAND)?;
                core.streamer_mut().pause();
                core.set_control_state(ControlState::SendingPaused);
            }
        }
        Ok(())
    }

    fn after_cancel(&mut self, core: &mut ControllerCore) -> Result<()> {
        if core.capabilities().has(Capability::RealTime) {
            self.canceling = true;
            self.cancel_attempts = CANCEL_ATTEMPTS;
            self.cancel_last_position = None;
        }
        Ok(())
    }

    fn on_pause(&mut self, core: &mut ControllerCore) -> Result<()> {
        if core.capabilities().has(Capability::RealTime) {
            core.send_byte(GRBL_PAUSE_COMMAND)?;
        }
        Ok(())
    }

    fn on_resume(&mut self, core: &mut ControllerCore) -> Result<()> {
        if core.capabilities().has(Capability::RealTime) {
            core.send_byte(GRBL_RESUME_COMMAND)?;
        }
        Ok(())
    }

    fn poll_status(&mut self, core: &mut ControllerCore) -> Result<()> {
        if core.capabilities().has(Capability::RealTime) {
            core.send_byte(GRBL_STATUS_COMMAND)?;
        }
        Ok(())
    }

    fn on_status_rate_changed(&mut self, core: &mut ControllerCore) {
        if core.is_polling() {
            core.restart_polling();
        }
    }

    fn perform_homing_cycle(&mut self, core: &mut ControllerCore) -> Result<()> {
        let version = self.booted_version()?;
        match homing_command(&version) {
            Some(cmd) => core.send_command_immediately(Command::new(cmd)),
            None => Err(not_supported(self.firmware_label(), "homing")),
        }
    }

    fn set_work_position(
        &mut self,
        core: &mut ControllerCore,
        position: &PartialPosition,
    ) -> Result<()> {
        let version = self.booted_version()?;
        match set_work_position_command(&version, position) {
            Some(cmd) => core.send_command_immediately(Command::new(cmd)),
            None => Err(not_supported(self.firmware_label(), "set work position")),
        }
    }

    fn reset_coordinates_to_zero(&mut self, core: &mut ControllerCore) -> Result<()> {
        let version = self.booted_version()?;
        match reset_coordinates_command(&version) {
            Some(cmd) => core.send_command_immediately(Command::new(cmd)),
            None => Err(not_supported(self.firmware_label(), "reset coordinates to zero")),
        }
    }

    fn kill_alarm_lock(&mut self, core: &mut ControllerCore) -> Result<()> {
        let version = self.booted_version()?;
        if !version.has_system_commands() {
            return Err(not_supported(self.firmware_label(), "kill alarm lock"));
        }
        core.send_command_immediately(Command::new("$X"))
    }

    fn toggle_check_mode(&mut self, core: &mut ControllerCore) -> Result<()> {
        let version = self.booted_version()?;
        if !version.has_system_commands() {
            return Err(not_supported(self.firmware_label(), "check mode"));
        }
        core.send_command_immediately(Command::new("$C"))
    }

    fn view_parser_state(&mut self, core: &mut ControllerCore) -> Result<()> {
        let version = self.booted_version()?;
        if !version.has_system_commands() {
            return Err(not_supported(self.firmware_label(), "view parser state"));
        }
        core.send_command_immediately(Command::new("$G"))
    }

    fn request_status_report(&mut self, core: &mut ControllerCore) -> Result<()> {
        self.require_real_time(core, "status report")?;
        core.send_byte(GRBL_STATUS_COMMAND)
    }

    fn soft_reset(&mut self, core: &mut ControllerCore) -> Result<()> {
        self.require_real_time(core, "soft reset")?;
        core.streamer_mut().cancel();
        core.send_byte(GRBL_RESET_COMMAND)
    }

    fn send_override(&mut self, core: &mut ControllerCore, command: Override) -> Result<()> {
        if !core.capabilities().has(Capability::Overrides) {
            return Err(cncstream_core::FirmwareError::UnsupportedFeature {
                firmware: self.firmware_label(),
                feature: format!("override ({})", command),
            }
            .into());
        }
        let byte = override_byte(command);
        core.send_byte(byte)?;
        core.console(MessageLevel::Info, format!(">>> 0x{:02x}", byte));
        Ok(())
    }

    fn jog(
        &mut self,
        core: &mut ControllerCore,
        distance: &PartialPosition,
        feed_rate: f64,
    ) -> Result<()> {
        if !core.capabilities().has(Capability::HardwareJogging) {
            return crate::firmware::default_jog(&*self, core, distance, feed_rate);
        }
        let mut words = vec!["$J=G91".to_string()];
        if let Some(units) = distance.units.gcode() {
            words.push(units.to_string());
        }
        words.push(distance.format_gcode());
        words.push(format!("F{}", feed_rate));
        core.send_command_immediately(Command::temporary(words.join(" ")))
    }

    fn setting_command(&self, key: &str, value: &str) -> Result<String> {
        Ok(setting_command(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_count() {
        let mut caps = Capabilities::from_slice(&[Capability::XAxis, Capability::ZAxis]);
        apply_axis_count(&mut caps, 4);
        assert_eq!(caps.axes(), vec![Axis::X, Axis::Y, Axis::Z, Axis::A]);
        apply_axis_count(&mut caps, 2);
        assert_eq!(caps.axes(), vec![Axis::X, Axis::Y]);
    }

    #[test]
    fn test_dialect_identity() {
        assert_eq!(GrblDialect::new().firmware(), Firmware::Grbl);
        assert_eq!(GrblDialect::esp32().firmware(), Firmware::GrblEsp32);
        let dialect = GrblDialect::new();
        assert_eq!(dialect.buffer_size(), 123);
        let filter = dialect.exclusive_filter().unwrap();
        assert!(filter("$22=1"));
        assert!(!filter("G0 X1"));
    }

    #[test]
    fn test_axis_count_message() {
        let caps = axis_count_regex().captures("[MSG:Axis count 5]").unwrap();
        assert_eq!(&caps[1], "5");
        assert!(axis_count_regex().captures("[MSG:Caution: Unlocked]").is_none());
    }
}
