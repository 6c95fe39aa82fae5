//! Controller
//!
//! [`Controller`] is the caller facing side of the protocol engine. It owns
//! the connection, the streamer and the firmware dialect behind one lock,
//! routes every inbound line through the dialect, drives the status poll
//! and the connection watchdog, and offers blocking firmware setting
//! writes on top of the asynchronous response stream.

pub mod core;
pub mod modal;

pub use self::core::{setting_values_equal, ControllerCore, PollConfig, RowCounts, Stopwatch};
pub use modal::{DistanceMode, ModalState};

use crate::communication::buffered::{BufferedStreamer, StreamerConfig};
use crate::communication::serial::SerialConnection;
use crate::communication::source::{CommandSource, FileSource};
use crate::communication::{Connection, ResponseSink};
use crate::firmware::{
    ConnectionWatchConfig, ConnectionWatchState, ConnectionWatcher, Firmware, FirmwareDialect,
    PollTick,
};
use cncstream_core::{
    Axis, Capabilities, Command, ConnectionError, ControlState, ControllerError, ControllerEvent,
    ControllerListener, ControllerListenerHandle, ControllerStatus, ControllerState, Error,
    EventDispatcher, FirmwareError, FirmwareSetting, MessageLevel, Override, PartialPosition,
    Result, Units,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub firmware: Firmware,
    /// Send one command at a time
    pub single_step: bool,
    /// Receive buffer override; the firmware's own size when unset
    pub buffer_size: Option<usize>,
    pub status_updates_enabled: bool,
    pub status_update_rate_ms: u64,
    pub watchdog: ConnectionWatchConfig,
    /// How long a setting write waits for its acknowledgment
    pub settings_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            firmware: Firmware::Grbl,
            single_step: false,
            buffer_size: None,
            status_updates_enabled: true,
            status_update_rate_ms: 200,
            watchdog: ConnectionWatchConfig::default(),
            settings_timeout_ms: 2000,
        }
    }
}

struct ControllerInner {
    core: ControllerCore,
    dialect: Box<dyn FirmwareDialect>,
}

struct Shared {
    inner: Mutex<ControllerInner>,
    events: EventDispatcher,
    watcher: ConnectionWatcher,
    settings_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock()
    }

    /// Entry point for every line the transport reads
    fn handle_line(&self, line: &str) {
        self.watcher.heartbeat();
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        if !core.is_open() {
            tracing::trace!("Dropping line received while closed: {}", line);
            return;
        }
        core.publish(ControllerEvent::RawResponse(line.to_string()));
        if let Err(e) = dialect.handle_response(core, line) {
            core.console(
                MessageLevel::Error,
                format!("Error while processing response <{}>: {}", line, e),
            );
        }
    }

    fn handle_poll_tick(&self) {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        if !core.is_open() || !core.polls_mut().tick() {
            return;
        }
        if let Err(e) = dialect.poll_status(core) {
            tracing::debug!("Status poll failed: {}", e);
            core.console(MessageLevel::Info, "Error sending status request");
        }
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        if !core.is_open() && core.control_state() == ControlState::Disconnected {
            return Ok(());
        }

        self.watcher.stop();
        dialect.before_close(core);
        core.console(MessageLevel::Info, "**** Connection closed ****");
        core.reset_session();
        let result = core.streamer_mut().connection_mut().close();
        dialect.after_close(core);
        core.set_port(None, 0);
        core.set_control_state(ControlState::Disconnected);
        let status = core
            .status()
            .clone()
            .with_state("Disconnected", ControllerState::Disconnected);
        core.set_status(status);
        result
    }
}

/// Protocol engine facade for one firmware connection.
///
/// Cloning is cheap; clones share the same connection. Inbound lines may be
/// delivered from any thread, and every operation takes the same lock, so
/// the streamer and the dialect only ever see one writer at a time.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Create a controller over `connection`.
    ///
    /// Must be called inside a tokio runtime; the event dispatcher, poll
    /// timer and watchdog run on it.
    pub fn new(config: ControllerConfig, connection: Box<dyn Connection>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::other(format!("controller needs a tokio runtime: {}", e)))?;
        let dialect = config.firmware.create_dialect();
        let streamer_config = StreamerConfig {
            buffer_size: config.buffer_size.unwrap_or_else(|| dialect.buffer_size()),
            single_step: config.single_step || dialect.requires_single_step(),
        };
        let mut streamer = BufferedStreamer::new(connection, streamer_config);
        streamer.set_exclusive_filter(dialect.exclusive_filter());

        let events = EventDispatcher::new(&runtime);
        let poll_config = PollConfig {
            enabled: config.status_updates_enabled,
            rate_ms: config.status_update_rate_ms,
        };
        let core = ControllerCore::new(
            streamer,
            events.clone(),
            runtime.clone(),
            config.firmware,
            poll_config,
        );

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let mut core = core;
            let weak = weak.clone();
            let tick: PollTick = Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_poll_tick();
                }
            });
            core.set_poll_tick(tick);
            Shared {
                inner: Mutex::new(ControllerInner { core, dialect }),
                events,
                watcher: ConnectionWatcher::new(config.watchdog, runtime),
                settings_timeout: Duration::from_millis(config.settings_timeout_ms),
            }
        });

        tracing::debug!("Created {} controller", config.firmware);
        Ok(Self { shared })
    }

    /// Controller over a serial port
    pub fn serial(config: ControllerConfig) -> Result<Self> {
        Self::new(config, Box::new(SerialConnection::new()))
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.shared.lock()
    }

    // ---- connection ---------------------------------------------------

    /// Open the connection and start the firmware handshake.
    ///
    /// Opening an open controller does nothing.
    pub fn open(&self, port: &str, baud_rate: u32) -> Result<()> {
        {
            let mut guard = self.lock();
            let ControllerInner { core, dialect } = &mut *guard;
            if core.is_open() {
                return Ok(());
            }

            core.set_control_state(ControlState::Connecting);
            let weak = Arc::downgrade(&self.shared);
            let sink: Arc<dyn ResponseSink> = Arc::new(move |line: &str| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_line(line);
                }
            });
            if let Err(e) = core.streamer_mut().connection_mut().open(port, baud_rate, sink) {
                core.console(
                    MessageLevel::Error,
                    format!("Unable to open {} @ {} baud: {}", port, baud_rate, e),
                );
                core.set_control_state(ControlState::Disconnected);
                return Err(e);
            }

            core.set_port(Some(port.to_string()), baud_rate);
            core.streamer_mut().reset_command_numbers();
            core.set_control_state(ControlState::Idle);
            core.console(
                MessageLevel::Info,
                format!("**** Connected to {} @ {} baud ****", port, baud_rate),
            );
            if let Err(e) = dialect.on_open(core) {
                core.console(
                    MessageLevel::Error,
                    format!("Error while initializing the controller: {}", e),
                );
            }
        }

        let probe = Arc::downgrade(&self.shared);
        let is_alive = Arc::new(move || {
            probe
                .upgrade()
                .is_some_and(|shared| shared.lock().core.is_open())
        });
        let lost = Arc::downgrade(&self.shared);
        let on_lost = Arc::new(move || {
            if let Some(shared) = lost.upgrade() {
                shared
                    .lock()
                    .core
                    .console(MessageLevel::Error, "Connection to the controller was lost");
                if let Err(e) = shared.close() {
                    tracing::warn!("Error closing lost connection: {}", e);
                }
            }
        });
        self.shared.watcher.start(is_alive, on_lost);
        Ok(())
    }

    /// Close the connection. Closing a closed controller does nothing.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    pub fn is_open(&self) -> bool {
        self.lock().core.is_open()
    }

    pub fn port(&self) -> Option<String> {
        self.lock().core.port().map(str::to_string)
    }

    pub fn watchdog_state(&self) -> ConnectionWatchState {
        self.shared.watcher.state()
    }

    /// Milliseconds since the firmware last sent anything
    pub fn time_since_response(&self) -> u64 {
        self.shared.watcher.time_since_heartbeat()
    }

    // ---- queueing -----------------------------------------------------

    /// Queue a command for the next streaming session
    pub fn queue_command(&self, command: Command) {
        self.lock().core.queue_command(command);
    }

    /// Queue a stream for the next streaming session
    pub fn queue_stream(&self, source: Box<dyn CommandSource>) {
        self.lock().core.queue_stream(source);
    }

    /// Queue the lines of a G-code file
    pub fn queue_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let source = FileSource::open(path)?;
        self.queue_stream(Box::new(source));
        Ok(())
    }

    /// Send one command now, ahead of anything queued
    pub fn send_command_immediately(&self, command: Command) -> Result<()> {
        self.lock().core.send_command_immediately(command)
    }

    /// Rows waiting for the next streaming session
    pub fn queued_rows(&self) -> usize {
        self.lock().core.queued_rows()
    }

    // ---- streaming ----------------------------------------------------

    /// Start streaming everything queued
    pub fn begin_streaming(&self) -> Result<()> {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        if !core.is_open() {
            return Err(ControllerError::NotConnected.into());
        }
        if !core.is_ready() {
            return Err(ControllerError::NotReady.into());
        }
        if core.is_streaming() {
            return Err(ControllerError::AlreadyStreaming.into());
        }
        if core.streamer().has_active_commands() {
            return Err(ControllerError::ActiveCommandsOutstanding {
                summary: core.streamer().active_summary(),
            }
            .into());
        }
        if core.queued_rows() == 0 && core.streamer().is_drained() {
            return Err(ControllerError::NothingQueued.into());
        }
        dialect.check_ready_to_stream(core)?;

        tracing::info!("Starting stream of {} rows", core.queued_rows());
        core.start_stream()
    }

    pub fn pause_streaming(&self) -> Result<()> {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        if !core.is_open() {
            return Err(ControllerError::NotConnected.into());
        }
        core.console(MessageLevel::Info, "**** Pausing file transfer. ****");
        dialect.on_pause(core)?;
        if dialect.holds_queue_on_pause() {
            core.streamer_mut().pause();
        }
        core.set_control_state(ControlState::SendingPaused);
        core.stopwatch_mut().suspend();
        Ok(())
    }

    pub fn resume_streaming(&self) -> Result<()> {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        if !core.is_open() {
            return Err(ControllerError::NotConnected.into());
        }
        core.console(MessageLevel::Info, "**** Resuming file transfer. ****");
        dialect.on_resume(core)?;
        core.streamer_mut().resume();
        core.set_control_state(ControlState::Sending);
        core.stopwatch_mut().resume();
        core.pump()
    }

    /// Stop streaming and discard everything not yet sent, including rows
    /// queued for the next session. Commands already sent are still
    /// acknowledged.
    pub fn cancel_send(&self) -> Result<()> {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        if !core.is_open() {
            return Err(ControllerError::NotConnected.into());
        }
        core.console(MessageLevel::Info, "**** Canceling file transfer. ****");
        dialect.before_cancel(core)?;
        core.streamer_mut().cancel();
        core.clear_queued();
        dialect.after_cancel(core)?;
        if !core.streamer().has_active_commands() {
            core.end_stream();
            core.set_control_state(ControlState::Idle);
        }
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().core.is_streaming()
    }

    pub fn is_paused(&self) -> bool {
        self.lock().core.is_paused()
    }

    pub fn rows(&self) -> RowCounts {
        self.lock().core.rows()
    }

    pub fn stream_started_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.lock().core.stream_started_at()
    }

    /// Streaming time of the current or last session, excluding pauses
    pub fn send_duration(&self) -> Duration {
        self.lock().core.stopwatch().elapsed()
    }

    pub fn active_command_count(&self) -> usize {
        self.lock().core.streamer().active_count()
    }

    /// Bytes sent and not yet acknowledged
    pub fn sent_buffer_size(&self) -> usize {
        self.lock().core.streamer().sent_buffer_size()
    }

    pub fn buffer_usage_percent(&self) -> u32 {
        self.lock().core.streamer().buffer_usage_percent()
    }

    pub fn single_step(&self) -> bool {
        self.lock().core.streamer().single_step()
    }

    pub fn set_single_step(&self, enabled: bool) {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        core.streamer_mut()
            .set_single_step(enabled || dialect.requires_single_step());
    }

    // ---- status -------------------------------------------------------

    pub fn status(&self) -> ControllerStatus {
        self.lock().core.status().clone()
    }

    pub fn control_state(&self) -> ControlState {
        self.lock().core.control_state()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.lock().core.capabilities().clone()
    }

    pub fn firmware(&self) -> Firmware {
        self.lock().core.firmware()
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.lock().core.firmware_version().map(str::to_string)
    }

    /// The firmware finished booting
    pub fn is_ready(&self) -> bool {
        self.lock().core.is_ready()
    }

    pub fn modal_state(&self) -> ModalState {
        self.lock().core.modal().clone()
    }

    pub fn probe_position(&self) -> Option<cncstream_core::Position> {
        self.lock().core.probe_position()
    }

    pub fn status_updates_enabled(&self) -> bool {
        self.lock().core.poll_config().enabled
    }

    /// Turn status polling on or off, rebuilding the poll timer
    pub fn set_status_updates_enabled(&self, enabled: bool) {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        let config = PollConfig {
            enabled,
            ..core.poll_config()
        };
        core.set_poll_config(config);
        if !enabled {
            core.stop_polling();
        } else if core.is_open() && core.is_ready() {
            core.restart_polling();
        }
        dialect.on_status_rate_changed(core);
    }

    pub fn status_update_rate(&self) -> u64 {
        self.lock().core.poll_config().rate_ms
    }

    /// Change the status poll interval, rebuilding the poll timer
    pub fn set_status_update_rate(&self, rate_ms: u64) {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        let config = PollConfig {
            rate_ms,
            ..core.poll_config()
        };
        core.set_poll_config(config);
        dialect.on_status_rate_changed(core);
    }

    pub fn is_polling(&self) -> bool {
        self.lock().core.is_polling()
    }

    // ---- machine control ----------------------------------------------

    fn with_dialect<T>(
        &self,
        op: impl FnOnce(&mut dyn FirmwareDialect, &mut ControllerCore) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.lock();
        let ControllerInner { core, dialect } = &mut *guard;
        op(dialect.as_mut(), core)
    }

    pub fn perform_homing_cycle(&self) -> Result<()> {
        self.with_dialect(|d, core| d.perform_homing_cycle(core))
    }

    pub fn return_to_home(&self) -> Result<()> {
        self.with_dialect(|d, core| d.return_to_home(core))
    }

    /// Make the current machine position read as `position` in the active
    /// work coordinate system
    pub fn set_work_position(&self, position: &PartialPosition) -> Result<()> {
        self.with_dialect(|d, core| d.set_work_position(core, position))
    }

    pub fn reset_coordinates_to_zero(&self) -> Result<()> {
        self.with_dialect(|d, core| d.reset_coordinates_to_zero(core))
    }

    pub fn kill_alarm_lock(&self) -> Result<()> {
        self.with_dialect(|d, core| d.kill_alarm_lock(core))
    }

    pub fn toggle_check_mode(&self) -> Result<()> {
        self.with_dialect(|d, core| d.toggle_check_mode(core))
    }

    pub fn view_parser_state(&self) -> Result<()> {
        self.with_dialect(|d, core| d.view_parser_state(core))
    }

    pub fn request_status_report(&self) -> Result<()> {
        self.with_dialect(|d, core| d.request_status_report(core))
    }

    pub fn soft_reset(&self) -> Result<()> {
        self.with_dialect(|d, core| d.soft_reset(core))
    }

    pub fn send_override(&self, command: Override) -> Result<()> {
        self.with_dialect(|d, core| d.send_override(core, command))
    }

    /// Relative jog by `distance` at `feed_rate` in the distance's units
    pub fn jog(&self, distance: &PartialPosition, feed_rate: f64) -> Result<()> {
        self.with_dialect(|d, core| d.jog(core, distance, feed_rate))
    }

    /// Probe along `axis` for at most `distance` at `feed_rate`, both in `units`
    pub fn probe(&self, axis: Axis, distance: f64, feed_rate: f64, units: Units) -> Result<()> {
        self.with_dialect(|d, core| d.probe(core, axis, distance, feed_rate, units))
    }

    /// Set a dynamic tool length offset
    pub fn offset_tool(&self, axis: Axis, offset: f64, units: Units) -> Result<()> {
        self.with_dialect(|d, core| d.offset_tool(core, axis, offset, units))
    }

    /// Put the firmware back in the operator's distance mode and units
    pub fn restore_parser_modal_state(&self) -> Result<()> {
        self.lock().core.restore_parser_modal_state()
    }

    // ---- firmware settings --------------------------------------------

    /// Firmware settings read so far, sorted by key
    pub fn settings(&self) -> Vec<FirmwareSetting> {
        self.lock().core.settings().all()
    }

    pub fn setting(&self, key: &str) -> Option<FirmwareSetting> {
        self.lock().core.settings().get(key).cloned()
    }

    /// Write a firmware setting and wait for the firmware to accept it.
    ///
    /// The streamer runs in single-step mode with status polling off until
    /// the write resolves; both are restored whatever the outcome.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let rx = {
            let mut guard = self.lock();
            let ControllerInner { core, dialect } = &mut *guard;
            if !core.is_open() {
                return Err(ControllerError::NotConnected.into());
            }
            let state = core.control_state();
            if state != ControlState::Idle && state != ControlState::Check {
                return Err(ControllerError::InvalidState {
                    reason: format!("settings can only be changed while idle, not {}", state),
                }
                .into());
            }
            if core.pending_setting().is_some() {
                return Err(FirmwareError::SettingUpdateInProgress {
                    setting: key.to_string(),
                }
                .into());
            }
            if core
                .settings()
                .get(key)
                .is_some_and(|s| setting_values_equal(&s.value, value))
            {
                tracing::debug!("Setting {} already has value {}", key, value);
                return Ok(());
            }

            let text = dialect.setting_command(key, value)?;
            let rx = core.begin_setting_update(key, value, text.clone());
            if let Err(e) = core.send_command_immediately(Command::new(text)) {
                core.finish_setting_update();
                return Err(e);
            }
            rx
        };

        let result = match tokio::time::timeout(self.shared.settings_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::ConnectionLost {
                reason: format!("connection closed while writing setting {}", key),
            }
            .into()),
            Err(_) => Err(ControllerError::Timeout {
                timeout_ms: self.shared.settings_timeout.as_millis() as u64,
            }
            .into()),
        };

        let mut guard = self.lock();
        let core = &mut guard.core;
        core.finish_setting_update();
        if let Err(e) = &result {
            core.streamer_mut().cancel();
            core.console(
                MessageLevel::Error,
                format!("Unable to set {} to {}: {}", key, value, e),
            );
        }
        result
    }

    // ---- listeners ----------------------------------------------------

    pub fn register_listener(
        &self,
        listener: Arc<dyn ControllerListener>,
    ) -> ControllerListenerHandle {
        self.shared.events.register(listener)
    }

    pub fn unregister_listener(&self, handle: &ControllerListenerHandle) -> bool {
        self.shared.events.unregister(handle)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.events.listener_count()
    }

    /// Wait until every event produced so far reached the listeners
    pub async fn flush_events(&self) {
        self.shared.events.flush().await;
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.lock();
        f.debug_struct("Controller")
            .field("firmware", &guard.core.firmware())
            .field("port", &guard.core.port())
            .field("state", &guard.core.control_state())
            .finish()
    }
}
