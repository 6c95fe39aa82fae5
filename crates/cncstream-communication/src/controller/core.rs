//! Shared controller state
//!
//! [`ControllerCore`] holds everything the firmware dialects read and
//! mutate: the streamer and its transport, the machine status, the control
//! state, modal state, firmware settings, the poll timer and the counters
//! of the current streaming session. The controller keeps it behind a
//! single lock together with the active dialect.

use crate::communication::buffered::{BufferedStreamer, StreamerEvent};
use crate::communication::source::CommandSource;
use crate::controller::modal::ModalState;
use crate::firmware::status_poll::{OutstandingPolls, PollTick, StatusPoller};
use crate::firmware::Firmware;
use cncstream_core::{
    Capabilities, Command, ControlState, ControllerError, ControllerEvent,
    ControllerState, ControllerStatus, EventDispatcher, FirmwareError, FirmwareSetting,
    FirmwareSettingsStore, MessageLevel, Position, Result, Units,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Row counters of a streaming session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RowCounts {
    /// Rows queued when the session started
    pub total: usize,
    /// Rows written to the transport
    pub sent: usize,
    /// Rows acknowledged
    pub completed: usize,
    /// Rows dropped without being sent
    pub skipped: usize,
    /// Rows the firmware answered with an error
    pub errors: usize,
}

impl RowCounts {
    /// Rows finished one way or another
    pub fn finished(&self) -> usize {
        self.completed + self.skipped
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.finished())
    }
}

/// Wall clock of a streaming session, not counting paused time
#[derive(Debug, Default, Clone, Copy)]
pub struct Stopwatch {
    started: Option<Instant>,
    accumulated: Duration,
}

impl Stopwatch {
    pub fn start(&mut self) {
        self.accumulated = Duration::ZERO;
        self.started = Some(Instant::now());
    }

    pub fn suspend(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    pub fn resume(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        self.suspend();
    }

    pub fn elapsed(&self) -> Duration {
        self.accumulated + self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// `HH:MM:SS`
    pub fn formatted(&self) -> String {
        let secs = self.elapsed().as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    }
}

/// Status polling preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub enabled: bool,
    pub rate_ms: u64,
}

/// A firmware setting write waiting for its acknowledgment
pub struct PendingSetting {
    pub key: String,
    pub value: String,
    /// Command that carries the assignment
    pub command_text: String,
    saved_single_step: bool,
    saved_polling: bool,
    tx: Option<oneshot::Sender<Result<()>>>,
}

/// Numeric settings compare by value, so `1.0` and `1` are the same
pub fn setting_values_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    if a == b {
        return true;
    }
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

/// State shared by the controller and its firmware dialect
pub struct ControllerCore {
    streamer: BufferedStreamer,
    events: EventDispatcher,
    firmware: Firmware,
    capabilities: Capabilities,
    status: ControllerStatus,
    control_state: ControlState,
    modal: ModalState,
    settings: FirmwareSettingsStore,
    polls: OutstandingPolls,
    poller: StatusPoller,
    poll_config: PollConfig,
    poll_tick: Option<PollTick>,
    firmware_version: Option<String>,
    ready: bool,
    streaming: bool,
    rows: RowCounts,
    stopwatch: Stopwatch,
    started_at: Option<DateTime<Utc>>,
    pending_setting: Option<PendingSetting>,
    queued: VecDeque<Command>,
    queued_streams: VecDeque<Box<dyn CommandSource>>,
    port: Option<String>,
    baud_rate: u32,
    probe_position: Option<Position>,
}

impl ControllerCore {
    pub fn new(
        streamer: BufferedStreamer,
        events: EventDispatcher,
        runtime: Handle,
        firmware: Firmware,
        poll_config: PollConfig,
    ) -> Self {
        Self {
            streamer,
            events,
            firmware,
            capabilities: Capabilities::new(),
            status: ControllerStatus::new(ControllerState::Disconnected, Units::MM),
            control_state: ControlState::Disconnected,
            modal: ModalState::new(),
            settings: FirmwareSettingsStore::new(),
            polls: OutstandingPolls::new(),
            poller: StatusPoller::new(runtime),
            poll_config,
            poll_tick: None,
            firmware_version: None,
            ready: false,
            streaming: false,
            rows: RowCounts::default(),
            stopwatch: Stopwatch::default(),
            started_at: None,
            pending_setting: None,
            queued: VecDeque::new(),
            queued_streams: VecDeque::new(),
            port: None,
            baud_rate: 0,
            probe_position: None,
        }
    }

    // ---- events -------------------------------------------------------

    pub fn publish(&self, event: ControllerEvent) {
        self.events.publish(event);
    }

    /// Console message for listeners, mirrored to the log
    pub fn console(&self, level: MessageLevel, text: impl Into<String>) {
        let text = text.into();
        match level {
            MessageLevel::Verbose => tracing::trace!("{}", text),
            MessageLevel::Info => tracing::debug!("{}", text),
            MessageLevel::Error => tracing::warn!("{}", text),
        }
        self.events.publish(ControllerEvent::Console { level, text });
    }

    // ---- connection ---------------------------------------------------

    pub fn is_open(&self) -> bool {
        self.streamer.connection().is_open()
    }

    pub fn firmware(&self) -> Firmware {
        self.firmware
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub(crate) fn set_port(&mut self, port: Option<String>, baud_rate: u32) {
        self.port = port;
        self.baud_rate = baud_rate;
    }

    pub fn streamer(&self) -> &BufferedStreamer {
        &self.streamer
    }

    pub fn streamer_mut(&mut self) -> &mut BufferedStreamer {
        &mut self.streamer
    }

    // ---- firmware identity --------------------------------------------

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    pub fn set_firmware_version(&mut self, version: Option<String>) {
        self.firmware_version = version;
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn capabilities_mut(&mut self) -> &mut Capabilities {
        &mut self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    /// The firmware finished booting and accepts commands
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    // ---- state --------------------------------------------------------

    pub fn control_state(&self) -> ControlState {
        self.control_state
    }

    /// Change the control state, notifying listeners on a change.
    pub fn set_control_state(&mut self, state: ControlState) {
        if self.control_state == state {
            return;
        }
        if !self.control_state.can_transition_to(state) {
            tracing::warn!(
                "Unexpected control state transition {} -> {}",
                self.control_state,
                state
            );
        }
        tracing::debug!("Control state {} -> {}", self.control_state, state);
        self.control_state = state;
        self.publish(ControllerEvent::StateChanged(state));
    }

    pub fn status(&self) -> &ControllerStatus {
        &self.status
    }

    /// Replace the status snapshot and dispatch it
    pub fn set_status(&mut self, status: ControllerStatus) {
        self.status = status;
        self.publish(ControllerEvent::StatusChanged(self.status.clone()));
    }

    pub fn modal(&self) -> &ModalState {
        &self.modal
    }

    pub fn modal_mut(&mut self) -> &mut ModalState {
        &mut self.modal
    }

    pub fn probe_position(&self) -> Option<Position> {
        self.probe_position
    }

    pub fn set_probe_position(&mut self, position: Position) {
        self.probe_position = Some(position);
    }

    // ---- settings -----------------------------------------------------

    pub fn settings(&self) -> &FirmwareSettingsStore {
        &self.settings
    }

    /// Store a setting reported by the firmware.
    ///
    /// A report that matches the value of a pending write completes it.
    pub fn update_setting(&mut self, setting: FirmwareSetting) -> bool {
        let matches_pending = self
            .pending_setting
            .as_ref()
            .is_some_and(|p| p.key == setting.key && setting_values_equal(&p.value, &setting.value));
        let changed = self.settings.update(setting.clone());
        if changed {
            self.publish(ControllerEvent::SettingUpdated(setting));
        }
        if matches_pending {
            self.resolve_pending_setting(Ok(()));
        }
        changed
    }

    pub fn pending_setting(&self) -> Option<&PendingSetting> {
        self.pending_setting.as_ref()
    }

    /// Register a setting write and put the streamer in single-step mode
    /// with polling off until it completes.
    pub(crate) fn begin_setting_update(
        &mut self,
        key: &str,
        value: &str,
        command_text: String,
    ) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.pending_setting = Some(PendingSetting {
            key: key.to_string(),
            value: value.to_string(),
            command_text,
            saved_single_step: self.streamer.single_step(),
            saved_polling: self.poller.is_running(),
            tx: Some(tx),
        });
        self.streamer.set_single_step(true);
        self.stop_polling();
        rx
    }

    /// Restore single-step and polling and forget the pending write
    pub(crate) fn finish_setting_update(&mut self) {
        if let Some(pending) = self.pending_setting.take() {
            self.streamer.set_single_step(pending.saved_single_step);
            if pending.saved_polling && self.is_open() {
                self.begin_polling();
            }
        }
    }

    fn resolve_pending_setting(&mut self, result: Result<()>) {
        if let Some(tx) = self.pending_setting.as_mut().and_then(|p| p.tx.take()) {
            let _ = tx.send(result);
        }
    }

    fn resolve_setting_ack(&mut self, command: &Command, is_error: bool) {
        let Some(pending) = self.pending_setting.as_ref() else {
            return;
        };
        if pending.tx.is_none() || pending.command_text != command.text {
            return;
        }
        if is_error {
            let err = FirmwareError::SettingRejected {
                setting: pending.key.clone(),
                response: command.response.clone().unwrap_or_default(),
            };
            self.resolve_pending_setting(Err(err.into()));
        } else {
            let setting = FirmwareSetting::new(pending.key.clone(), pending.value.clone());
            let setting = match self.settings.get(&setting.key) {
                Some(existing) => FirmwareSetting {
                    value: setting.value,
                    ..existing.clone()
                },
                None => setting,
            };
            self.update_setting(setting);
            self.resolve_pending_setting(Ok(()));
        }
    }

    // ---- polling ------------------------------------------------------

    pub(crate) fn set_poll_tick(&mut self, tick: PollTick) {
        self.poll_tick = Some(tick);
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll_config
    }

    pub(crate) fn set_poll_config(&mut self, config: PollConfig) {
        self.poll_config = config;
    }

    pub fn polls(&self) -> &OutstandingPolls {
        &self.polls
    }

    pub fn polls_mut(&mut self) -> &mut OutstandingPolls {
        &mut self.polls
    }

    /// Start the poll timer if status updates are enabled
    pub fn begin_polling(&mut self) {
        self.begin_polling_every(self.poll_config.rate_ms);
    }

    /// Start the poll timer at a firmware specific interval
    pub fn begin_polling_every(&mut self, rate_ms: u64) {
        if !self.poll_config.enabled {
            return;
        }
        if let Some(tick) = self.poll_tick.clone() {
            self.polls.received();
            self.poller.start(Duration::from_millis(rate_ms), tick);
        }
    }

    pub fn stop_polling(&mut self) {
        self.poller.stop();
    }

    pub fn restart_polling(&mut self) {
        self.stop_polling();
        self.begin_polling();
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    // ---- sending ------------------------------------------------------

    /// Send a command now, ahead of any stream
    pub fn send_command_immediately(&mut self, command: Command) -> Result<()> {
        if !self.is_open() {
            return Err(ControllerError::NotConnected.into());
        }
        if !self.ready {
            return Err(ControllerError::NotReady.into());
        }
        if !self.streaming {
            self.set_control_state(ControlState::Sending);
        }
        self.queue_and_send(command)
    }

    /// Queue and pump without any readiness checks. Used during handshakes.
    pub fn queue_and_send(&mut self, command: Command) -> Result<()> {
        self.streamer.enqueue_command(command);
        self.pump()
    }

    /// Write a real-time byte
    pub fn send_byte(&mut self, byte: u8) -> Result<()> {
        if !self.is_open() {
            return Err(ControllerError::NotConnected.into());
        }
        self.streamer.send_byte_immediately(byte)
    }

    /// Let the streamer send what flow control allows and report it
    pub fn pump(&mut self) -> Result<()> {
        let events = match self.streamer.pump() {
            Ok(events) => events,
            Err(e) => {
                self.abort_stream_on_write_failure(&e);
                return Err(e);
            }
        };
        for event in events {
            match event {
                StreamerEvent::Sent(command) => self.on_command_sent(command),
                StreamerEvent::Skipped(command) => self.on_command_skipped(command),
                StreamerEvent::Rejected(command) => self.on_command_rejected(command),
                StreamerEvent::SourceFailed {
                    source,
                    unread_rows,
                    error,
                } => self.on_source_failed(&source, unread_rows, &error),
            }
        }
        Ok(())
    }

    fn abort_stream_on_write_failure(&mut self, error: &cncstream_core::Error) {
        self.console(
            MessageLevel::Error,
            format!("Error while sending to the controller: {}", error),
        );
        if self.streaming {
            self.streaming = false;
            self.stopwatch.stop();
            self.streamer.cancel();
            self.publish(ControllerEvent::StreamComplete { success: false });
        }
    }

    fn on_command_sent(&mut self, command: Command) {
        if self.streaming {
            self.rows.sent += 1;
        }
        // JSON configuration lines carry no G-code words.
        if !command.temporary_modal_change && !command.text.starts_with('{') {
            self.modal.update(&command.text);
        }
        if let Some(comment) = &command.comment {
            self.publish(ControllerEvent::CommandComment(comment.clone()));
        }
        let text = command.text.clone();
        self.publish(ControllerEvent::CommandSent(command));
        self.console(MessageLevel::Info, format!(">>> {}", text));
    }

    fn on_command_skipped(&mut self, command: Command) {
        if self.streaming {
            self.rows.skipped += 1;
        }
        self.console(
            MessageLevel::Verbose,
            format!("Skipping line: {}", command.raw),
        );
        if let Some(comment) = &command.comment {
            self.publish(ControllerEvent::CommandComment(comment.clone()));
        }
        self.publish(ControllerEvent::CommandSkipped(command));
        self.check_stream_finished();
    }

    fn on_command_rejected(&mut self, command: Command) {
        if self.streaming {
            self.rows.completed += 1;
            self.rows.errors += 1;
        }
        self.console(
            MessageLevel::Error,
            format!(
                "Command does not fit in the {} byte receive buffer, dropped: {}",
                self.streamer.buffer_size(),
                command.text
            ),
        );
        self.publish(ControllerEvent::CommandComplete(command));
        self.check_stream_finished();
    }

    /// Rows a failed source could not read are finished as errors, so the
    /// session still ends, and ends unsuccessfully.
    fn on_source_failed(&mut self, source: &str, unread_rows: usize, error: &str) {
        if self.streaming {
            self.rows.skipped += unread_rows;
            self.rows.errors += unread_rows.max(1);
        }
        self.console(
            MessageLevel::Error,
            format!(
                "Failed reading {}, {} rows not sent: {}",
                source, unread_rows, error
            ),
        );
        self.check_stream_finished();
    }

    /// Oldest command still waiting for an acknowledgment
    pub fn active_command(&self) -> Option<&Command> {
        self.streamer.active_command()
    }

    /// Complete the oldest active command with a response from the firmware
    pub fn command_complete(&mut self, response: &str, is_error: bool) -> Result<()> {
        let Some(mut command) = self.streamer.acknowledge() else {
            return Err(ControllerError::UnexpectedResponse {
                response: response.to_string(),
            }
            .into());
        };
        command.complete(response, is_error);
        if self.streaming {
            self.rows.completed += 1;
            if is_error {
                self.rows.errors += 1;
            }
        }
        self.resolve_setting_ack(&command, is_error);

        if !self.streamer.has_active_commands()
            && !self.streaming
            && self.control_state == ControlState::Sending
        {
            self.set_control_state(ControlState::Idle);
        }

        self.publish(ControllerEvent::CommandComplete(command));
        self.check_stream_finished();
        self.pump()
    }

    /// End the session once every row is acknowledged
    pub fn check_stream_finished(&mut self) {
        if !self.streaming || self.streamer.has_active_commands() || !self.streamer.is_drained() {
            return;
        }
        self.stopwatch.stop();
        self.streaming = false;
        self.console(
            MessageLevel::Info,
            format!("**** Finished sending file in {} ****", self.stopwatch.formatted()),
        );
        self.publish(ControllerEvent::StreamComplete {
            success: self.rows.errors == 0,
        });
        self.set_control_state(ControlState::Idle);
    }

    /// Put the parser back in the tracked distance mode and units
    pub fn restore_parser_modal_state(&mut self) -> Result<()> {
        match self.modal.restore_command() {
            Some(text) => self.send_command_immediately(Command::temporary(text)),
            None => Ok(()),
        }
    }

    /// Forget everything queued and in flight after a firmware reset
    pub fn reset_buffers(&mut self) {
        self.streamer.cancel();
        self.streamer.reset();
    }

    // ---- streaming session --------------------------------------------

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_paused(&self) -> bool {
        self.streamer.is_paused()
    }

    pub fn rows(&self) -> RowCounts {
        self.rows
    }

    pub fn stopwatch(&self) -> &Stopwatch {
        &self.stopwatch
    }

    pub fn stopwatch_mut(&mut self) -> &mut Stopwatch {
        &mut self.stopwatch
    }

    /// When the current or last session started
    pub fn stream_started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub(crate) fn queue_command(&mut self, command: Command) {
        self.queued.push_back(command);
    }

    pub(crate) fn queue_stream(&mut self, source: Box<dyn CommandSource>) {
        self.queued_streams.push_back(source);
    }

    /// Drop everything queued for the next session
    pub(crate) fn clear_queued(&mut self) {
        self.queued.clear();
        self.queued_streams.clear();
    }

    /// Rows queued for the next session
    pub fn queued_rows(&self) -> usize {
        self.queued.len()
            + self
                .queued_streams
                .iter()
                .map(|s| s.rows_remaining())
                .sum::<usize>()
    }

    /// Hand the queued rows to the streamer and start sending.
    ///
    /// Preconditions are checked by the caller.
    pub(crate) fn start_stream(&mut self) -> Result<()> {
        self.rows = RowCounts {
            total: self.queued_rows(),
            ..RowCounts::default()
        };
        while let Some(command) = self.queued.pop_front() {
            self.streamer.enqueue_command(command);
        }
        while let Some(source) = self.queued_streams.pop_front() {
            self.console(
                MessageLevel::Info,
                format!("Streaming {} ({} rows)", source.name(), source.total_rows()),
            );
            self.streamer.enqueue_stream(source);
        }

        self.streaming = true;
        self.started_at = Some(Utc::now());
        self.stopwatch.start();
        self.set_control_state(ControlState::Sending);
        if let Err(e) = self.pump() {
            self.streaming = false;
            self.streamer.cancel();
            return Err(e);
        }
        self.check_stream_finished();
        Ok(())
    }

    /// End the session without completing it
    pub(crate) fn end_stream(&mut self) {
        self.streaming = false;
        self.stopwatch.stop();
    }

    /// Clear all per-connection state on close
    pub(crate) fn reset_session(&mut self) {
        self.stop_polling();
        self.streaming = false;
        self.stopwatch.stop();
        self.streamer.cancel();
        self.streamer.reset();
        self.streamer.reset_command_numbers();
        self.clear_queued();
        self.ready = false;
        self.modal.clear();
        self.polls.received();
        // Dropping the sender fails a waiting setting write.
        self.pending_setting = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_values_equal() {
        assert!(setting_values_equal("1", "1"));
        assert!(setting_values_equal("1.000", "1"));
        assert!(setting_values_equal(" 250 ", "250.0"));
        assert!(!setting_values_equal("0", "1"));
        assert!(!setting_values_equal("abc", "abd"));
    }

    #[test]
    fn test_row_counts() {
        let rows = RowCounts {
            total: 10,
            sent: 6,
            completed: 4,
            skipped: 2,
            errors: 1,
        };
        assert_eq!(rows.finished(), 6);
        assert_eq!(rows.remaining(), 4);
    }

    #[test]
    fn test_stopwatch_format() {
        let mut watch = Stopwatch::default();
        assert_eq!(watch.formatted(), "00:00:00");
        watch.accumulated = Duration::from_secs(3723);
        assert_eq!(watch.formatted(), "01:02:03");
        watch.start();
        watch.suspend();
        let paused = watch.elapsed();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(watch.elapsed(), paused);
    }
}
