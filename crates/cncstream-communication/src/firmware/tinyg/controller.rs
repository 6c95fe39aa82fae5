//! TinyG and g2core protocol state machine

use super::report::*;
use crate::controller::core::ControllerCore;
use crate::firmware::{control_state_for, not_supported, Firmware, FirmwareDialect};
use cncstream_core::{
    Capabilities, Capability, Command, ControlState, ControllerState, MessageLevel, Override,
    PartialPosition, Result, Units,
};
use serde_json::{Map, Value};

pub const TINYG_PAUSE_COMMAND: u8 = b'!';
pub const TINYG_RESUME_COMMAND: u8 = b'~';
pub const TINYG_QUEUE_FLUSH_COMMAND: u8 = b'%';
pub const TINYG_KILL_JOB_COMMAND: u8 = 0x04;
pub const TINYG_ENQUIRE_COMMAND: u8 = 0x05;
pub const TINYG_RESET_COMMAND: u8 = 0x18;

pub const STATUS_REPORT_COMMAND: &str = "{sr:n}";
pub const KILL_ALARM_COMMAND: &str = "{clear:n}";

/// Newest TinyG firmware this dialect knows
const LATEST_TINYG_VERSION: f64 = 0.97;

const TINYG_RX_BUFFER_SIZE: usize = 123;

const TINYG_STATUS_REPORT_CONFIG: &str = "{sr:{posx:t,posy:t,posz:t,mpox:t,mpoy:t,mpoz:t,plan:t,vel:t,unit:t,stat:t,dist:t,frmo:t,coor:t}}";
const G2CORE_STATUS_REPORT_CONFIG: &str = "{sr:{posx:t,posy:t,posz:t,mpox:t,mpoy:t,mpoz:t,plan:t,vel:t,unit:t,stat:t,dist:t,admo:t,frmo:t,coor:t}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    TinyG,
    G2Core,
}

/// TinyG and g2core dialect
#[derive(Debug)]
pub struct TinyGDialect {
    variant: Variant,
    version: Option<f64>,
    /// g2core reports jogs as plain motion; remember that a jog is running
    jogging: bool,
}

impl TinyGDialect {
    pub fn tinyg() -> Self {
        Self {
            variant: Variant::TinyG,
            version: None,
            jogging: false,
        }
    }

    pub fn g2core() -> Self {
        Self {
            variant: Variant::G2Core,
            ..Self::tinyg()
        }
    }

    pub fn version(&self) -> Option<f64> {
        self.version
    }

    fn init_commands(&self) -> Vec<&'static str> {
        match self.variant {
            Variant::TinyG => vec![
                "{ej:1}",
                TINYG_STATUS_REPORT_CONFIG,
                "{jv:4}",
                "{qv:0}",
                "{sv:1}",
                STATUS_REPORT_COMMAND,
            ],
            Variant::G2Core => vec![
                "{ej:1}",
                G2CORE_STATUS_REPORT_CONFIG,
                "{jv:4}",
                "{qv:0}",
                "{sv:1}",
                "$$",
                "{mfoe:1}",
                "{mtoe:1}",
                "{ssoe:1}",
                "{xam:1,yam:1,zam:1}",
                STATUS_REPORT_COMMAND,
            ],
        }
    }

    /// Switch the firmware to JSON mode and configure status reports
    fn send_init_commands(&mut self, core: &mut ControllerCore) -> Result<()> {
        for text in self.init_commands() {
            core.streamer_mut().enqueue_command(Command::new(text));
        }
        let interval = status_interval_command(core);
        core.streamer_mut().enqueue_command(interval);
        core.pump()
    }

    fn capabilities(&self) -> Capabilities {
        let mut capabilities = Capabilities::from_slice(&[
            Capability::XAxis,
            Capability::YAxis,
            Capability::ZAxis,
            Capability::ReturnToZero,
            Capability::Jogging,
            Capability::Homing,
            Capability::FirmwareSettings,
        ]);
        if self.variant == Variant::G2Core {
            for capability in [
                Capability::AAxis,
                Capability::BAxis,
                Capability::CAxis,
                Capability::ContinuousJogging,
                Capability::Overrides,
            ] {
                capabilities.add(capability);
            }
        }
        capabilities
    }

    fn handle_ready(&mut self, core: &mut ControllerCore, line: &str, version: Option<f64>) -> Result<()> {
        if let Some(version) = version {
            self.version = Some(version);
        }
        let label = match self.variant {
            Variant::TinyG => "TinyG",
            Variant::G2Core => "G2Core",
        };
        let version_text = self
            .version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown version".to_string());
        core.set_firmware_version(Some(format!("{} {}", label, version_text)));

        if self.variant == Variant::TinyG
            && self.version.is_some_and(|v| v > LATEST_TINYG_VERSION)
        {
            core.console(
                MessageLevel::Error,
                format!("Unsupported TinyG firmware version {}", version_text),
            );
            return Ok(());
        }

        core.set_capabilities(self.capabilities());
        core.set_ready(true);
        core.set_control_state(ControlState::Idle);
        core.console(MessageLevel::Info, format!("[ready] {}", line));

        match self.variant {
            Variant::TinyG => self.send_init_commands(core),
            // g2core answers the enquire byte with an ack, which triggers init.
            Variant::G2Core => {
                if core.send_byte(TINYG_ENQUIRE_COMMAND).is_err() {
                    core.console(MessageLevel::Error, "Couldn't enquire for controller status");
                }
                Ok(())
            }
        }
    }

    fn handle_status(&mut self, core: &mut ControllerCore, sr: &Map<String, Value>) {
        for word in modal_words(sr) {
            core.modal_mut().update(word);
        }
        let previous = core.status().clone();
        let mut status = update_status(&previous, sr);
        if self.variant == Variant::G2Core && self.jogging {
            match status.state {
                ControllerState::Run => {
                    status = status.with_state("Jog", ControllerState::Jog);
                }
                ControllerState::Idle => self.jogging = false,
                _ => {}
            }
        }

        let streaming = core.is_streaming();
        let paused = core.is_paused();
        let before = control_state_for(previous.state, streaming, paused);
        let after = control_state_for(status.state, streaming, paused);
        core.set_status(status);
        if before != after {
            tracing::debug!("TinyG state change {} -> {}", before, after);
            core.set_control_state(after);
        }
    }

    fn handle_command_response(&mut self, core: &mut ControllerCore, line: &str, error: bool) {
        if core.active_command().is_none() {
            core.check_stream_finished();
            return;
        }
        if let Err(e) = core.command_complete(line, error) {
            core.console(
                MessageLevel::Error,
                format!("Error while processing response <{}>: {}", line, e),
            );
        }
    }
}

/// `{si:ms}` for the configured status rate
fn status_interval_command(core: &ControllerCore) -> Command {
    Command::new(format!("{{si:{}}}", core.poll_config().rate_ms))
}

impl FirmwareDialect for TinyGDialect {
    fn firmware(&self) -> Firmware {
        match self.variant {
            Variant::TinyG => Firmware::TinyG,
            Variant::G2Core => Firmware::G2Core,
        }
    }

    fn buffer_size(&self) -> usize {
        TINYG_RX_BUFFER_SIZE
    }

    fn handle_response(&mut self, core: &mut ControllerCore, line: &str) -> Result<()> {
        let line = line.trim();
        let Some(report) = parse_report(line) else {
            core.console(MessageLevel::Verbose, line);
            return Ok(());
        };
        match report {
            TinyGReport::Restarting => {
                core.console(MessageLevel::Info, format!("[restarting] {}", line));
            }
            TinyGReport::Ready { version } => self.handle_ready(core, line, version)?,
            TinyGReport::Ack => {
                core.console(MessageLevel::Info, format!("[ack] {}", line));
                self.send_init_commands(core)?;
            }
            TinyGReport::Status(sr) => {
                self.handle_status(core, &sr);
                core.console(MessageLevel::Info, line);
                core.check_stream_finished();
            }
            // Every response envelope answers the oldest active command,
            // including the `{sr:n}` reply that carries a status report.
            TinyGReport::Response { status, error } => {
                if let Some(sr) = &status {
                    self.handle_status(core, sr);
                }
                self.handle_command_response(core, line, error);
                core.console(MessageLevel::Info, line);
            }
            TinyGReport::QueueReport(qr) => tracing::debug!("Queue buffer usage: {}", qr),
            TinyGReport::ReceiveReport(rx) => tracing::debug!("Receive queue buffer usage: {}", rx),
            TinyGReport::Unhandled => {
                core.console(MessageLevel::Info, format!("[unhandled message] {}", line));
            }
        }
        Ok(())
    }

    fn on_open(&mut self, core: &mut ControllerCore) -> Result<()> {
        self.version = None;
        self.jogging = false;
        core.set_ready(false);
        match self.variant {
            Variant::TinyG => core.send_byte(TINYG_RESET_COMMAND),
            Variant::G2Core => Ok(()),
        }
    }

    fn after_close(&mut self, core: &mut ControllerCore) {
        self.version = None;
        self.jogging = false;
        core.set_firmware_version(None);
        core.set_capabilities(Capabilities::new());
    }

    fn before_cancel(&mut self, core: &mut ControllerCore) -> Result<()> {
        if self.variant == Variant::TinyG {
            core.send_byte(TINYG_PAUSE_COMMAND)?;
            core.streamer_mut().pause();
            core.set_control_state(ControlState::SendingPaused);
        }
        Ok(())
    }

    fn after_cancel(&mut self, core: &mut ControllerCore) -> Result<()> {
        match self.variant {
            Variant::TinyG => {
                core.send_byte(TINYG_PAUSE_COMMAND)?;
                core.send_byte(TINYG_QUEUE_FLUSH_COMMAND)?;
                core.reset_buffers();
                Ok(())
            }
            Variant::G2Core => {
                core.send_byte(TINYG_KILL_JOB_COMMAND)?;
                core.reset_buffers();
                self.kill_alarm_lock(core)
            }
        }
    }

    fn on_pause(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_byte(TINYG_PAUSE_COMMAND)
    }

    fn on_resume(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_byte(TINYG_RESUME_COMMAND)
    }

    fn on_status_rate_changed(&mut self, core: &mut ControllerCore) {
        if !core.is_open() || !core.is_ready() {
            return;
        }
        let command = status_interval_command(core);
        if let Err(e) = core.queue_and_send(command) {
            tracing::warn!("Failed to update the status report interval: {}", e);
        }
    }

    fn perform_homing_cycle(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_command_immediately(Command::new("G28.2 Z0 X0 Y0"))
    }

    fn set_work_position(
        &mut self,
        core: &mut ControllerCore,
        position: &PartialPosition,
    ) -> Result<()> {
        let command =
            set_work_position_command(&core.status().machine_coord, core.modal(), position);
        core.send_command_immediately(Command::new(command))
    }

    fn reset_coordinates_to_zero(&mut self, core: &mut ControllerCore) -> Result<()> {
        let command = reset_coordinates_command(&core.status().machine_coord, core.modal());
        core.send_command_immediately(Command::new(command))
    }

    fn kill_alarm_lock(&mut self, core: &mut ControllerCore) -> Result<()> {
        core.send_command_immediately(Command::new(KILL_ALARM_COMMAND))
    }

    fn toggle_check_mode(&mut self, _core: &mut ControllerCore) -> Result<()> {
        Err(not_supported(self.firmware(), "check mode"))
    }

    fn view_parser_state(&mut self, core: &mut ControllerCore) -> Result<()> {
        if !core.is_open() {
            return Ok(());
        }
        core.send_command_immediately(Command::new(STATUS_REPORT_COMMAND))
    }

    fn request_status_report(&mut self, core: &mut ControllerCore) -> Result<()> {
        self.view_parser_state(core)
    }

    fn soft_reset(&mut self, core: &mut ControllerCore) -> Result<()> {
        match self.variant {
            Variant::TinyG => {
                core.streamer_mut().cancel();
                core.send_byte(TINYG_RESET_COMMAND)?;
            }
            Variant::G2Core => {
                core.send_byte(TINYG_KILL_JOB_COMMAND)?;
                core.send_byte(TINYG_QUEUE_FLUSH_COMMAND)?;
                core.send_byte(b'\n')?;
            }
        }
        core.set_control_state(ControlState::Disconnected);
        let status = core
            .status()
            .clone()
            .with_state("Disconnected", ControllerState::Disconnected);
        core.set_status(status);
        if self.variant == Variant::G2Core {
            self.send_init_commands(core)?;
        }
        Ok(())
    }

    fn send_override(&mut self, core: &mut ControllerCore, command: Override) -> Result<()> {
        match override_command(core.status().overrides, command) {
            Some(text) => core.send_command_immediately(Command::new(text)),
            None => {
                tracing::debug!("Override {} has no effect at the current ratios", command);
                Ok(())
            }
        }
    }

    /// Relative jog converted to the units the parser is in
    fn jog(
        &mut self,
        core: &mut ControllerCore,
        distance: &PartialPosition,
        feed_rate: f64,
    ) -> Result<()> {
        if self.variant == Variant::G2Core {
            self.jogging = true;
        }
        let target = core.modal().units();
        let scale = Units::convert(1.0, distance.units, target);
        let mut converted = PartialPosition::new(target);
        for (axis, value) in distance.axes() {
            converted = converted.with(axis, value * scale);
        }
        let text = format!("G91G1 {} F{}", converted.format_gcode(), feed_rate * scale);
        core.send_command_immediately(Command::temporary(text))?;
        core.restore_parser_modal_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        assert_eq!(TinyGDialect::tinyg().firmware(), Firmware::TinyG);
        assert_eq!(TinyGDialect::g2core().firmware(), Firmware::G2Core);
        assert!(!TinyGDialect::tinyg().requires_single_step());
    }

    #[test]
    fn test_init_sequences() {
        let tinyg = TinyGDialect::tinyg().init_commands();
        assert_eq!(tinyg.first(), Some(&"{ej:1}"));
        assert_eq!(tinyg.last(), Some(&STATUS_REPORT_COMMAND));
        assert!(!tinyg.contains(&"$$"));

        let g2 = TinyGDialect::g2core().init_commands();
        assert!(g2.contains(&"$$"));
        assert!(g2.contains(&"{mfoe:1}"));
        assert!(g2[1].contains("admo:t"));
    }

    #[test]
    fn test_capabilities() {
        let tinyg = TinyGDialect::tinyg().capabilities();
        assert!(tinyg.has(Capability::Homing));
        assert!(!tinyg.has(Capability::Overrides));
        assert!(!tinyg.has(Capability::AAxis));
        let g2 = TinyGDialect::g2core().capabilities();
        assert!(g2.has(Capability::Overrides));
        assert!(g2.has(Capability::CAxis));
    }
}
