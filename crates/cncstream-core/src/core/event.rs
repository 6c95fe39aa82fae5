//! Event system for controller communication
//!
//! Provides:
//! - Event types for command lifecycle, console output and status changes
//! - An ordered dispatcher that delivers events to listeners from a single
//!   worker task, decoupled from the thread that produced them

use crate::core::listener::{ControllerListener, ControllerListenerHandle};
use crate::core::message::MessageLevel;
use crate::data::command::Command;
use crate::data::settings::FirmwareSetting;
use crate::data::{ControlState, ControllerStatus};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

/// Controller event types
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Command written to the transport
    CommandSent(Command),
    /// Command dropped without being sent
    CommandSkipped(Command),
    /// Command acknowledged
    CommandComplete(Command),
    /// Comment attached to a sent or skipped command
    CommandComment(String),
    /// Console message
    Console {
        /// Message severity
        level: MessageLevel,
        /// Message text
        text: String,
    },
    /// Raw line from the firmware
    RawResponse(String),
    /// Status snapshot changed
    StatusChanged(ControllerStatus),
    /// Control state changed
    StateChanged(ControlState),
    /// Streaming session finished
    StreamComplete {
        /// True when no command failed during the session
        success: bool,
    },
    /// Firmware setting read or changed
    SettingUpdated(FirmwareSetting),
}

impl std::fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerEvent::CommandSent(cmd) => write!(f, "Sent: {}", cmd.text),
            ControllerEvent::CommandSkipped(cmd) => write!(f, "Skipped: {}", cmd.raw),
            ControllerEvent::CommandComplete(cmd) => write!(
                f,
                "Complete: {} ({})",
                cmd.text,
                cmd.response.as_deref().unwrap_or_default()
            ),
            ControllerEvent::CommandComment(c) => write!(f, "Comment: {}", c),
            ControllerEvent::Console { level, text } => write!(f, "[{}] {}", level, text),
            ControllerEvent::RawResponse(line) => write!(f, "Response: {}", line),
            ControllerEvent::StatusChanged(status) => write!(f, "Status: {}", status),
            ControllerEvent::StateChanged(state) => write!(f, "State: {}", state),
            ControllerEvent::StreamComplete { success } => {
                write!(f, "Stream complete (success: {})", success)
            }
            ControllerEvent::SettingUpdated(s) => write!(f, "Setting {}={}", s.key, s.value),
        }
    }
}

enum Dispatch {
    Event(ControllerEvent),
    Flush(oneshot::Sender<()>),
}

type ListenerList = Vec<(ControllerListenerHandle, Arc<dyn ControllerListener>)>;

/// Ordered event dispatcher
///
/// `publish` never blocks: events go onto an unbounded FIFO channel that a
/// single worker task drains, delivering each event to every listener
/// before taking the next one. Listeners therefore see events in exactly
/// the order they were published, regardless of which thread published
/// them.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<Dispatch>,
    listeners: Arc<RwLock<ListenerList>>,
}

impl EventDispatcher {
    /// Start a dispatcher whose worker runs on the given runtime.
    pub fn new(runtime: &Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listeners: Arc<RwLock<ListenerList>> = Arc::new(RwLock::new(Vec::new()));
        runtime.spawn(Self::run(rx, listeners.clone()));
        Self { tx, listeners }
    }

    /// Start a dispatcher on the runtime of the calling context.
    pub fn start() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::other(format!("event dispatcher needs a tokio runtime: {}", e)))?;
        Ok(Self::new(&runtime))
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Dispatch>, listeners: Arc<RwLock<ListenerList>>) {
        while let Some(item) = rx.recv().await {
            match item {
                Dispatch::Event(event) => {
                    let snapshot: Vec<Arc<dyn ControllerListener>> =
                        listeners.read().iter().map(|(_, l)| l.clone()).collect();
                    for listener in snapshot {
                        deliver(listener.as_ref(), &event).await;
                    }
                }
                Dispatch::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("Event dispatcher stopped");
    }

    /// Register a listener. Listeners are called in registration order.
    pub fn register(&self, listener: Arc<dyn ControllerListener>) -> ControllerListenerHandle {
        let handle = ControllerListenerHandle::new();
        self.listeners.write().push((handle.clone(), listener));
        handle
    }

    /// Remove a listener. Returns false if the handle was not registered.
    pub fn unregister(&self, handle: &ControllerListenerHandle) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(h, _)| h != handle);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Queue an event for delivery.
    pub fn publish(&self, event: ControllerEvent) {
        if self.tx.send(Dispatch::Event(event)).is_err() {
            tracing::warn!("Event dispatcher worker has stopped, dropping event");
        }
    }

    /// Wait until every event published before this call has been delivered.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Dispatch::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn deliver(listener: &dyn ControllerListener, event: &ControllerEvent) {
    match event {
        ControllerEvent::CommandSent(cmd) => listener.on_command_sent(cmd).await,
        ControllerEvent::CommandSkipped(cmd) => listener.on_command_skipped(cmd).await,
        ControllerEvent::CommandComplete(cmd) => listener.on_command_complete(cmd).await,
        ControllerEvent::CommandComment(c) => listener.on_command_comment(c).await,
        ControllerEvent::Console { level, text } => listener.on_console_message(*level, text).await,
        ControllerEvent::RawResponse(line) => listener.on_raw_response(line).await,
        ControllerEvent::StatusChanged(status) => listener.on_status_changed(status).await,
        ControllerEvent::StateChanged(state) => listener.on_state_changed(*state).await,
        ControllerEvent::StreamComplete { success } => listener.on_stream_complete(*success).await,
        ControllerEvent::SettingUpdated(s) => listener.on_setting_updated(s).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ControllerListener for Recorder {
        async fn on_command_sent(&self, command: &Command) {
            self.seen.lock().push(format!("sent {}", command.text));
        }

        async fn on_console_message(&self, _level: MessageLevel, message: &str) {
            // Slow listeners must not reorder delivery.
            tokio::task::yield_now().await;
            self.seen.lock().push(format!("console {}", message));
        }

        async fn on_raw_response(&self, response: &str) {
            self.seen.lock().push(format!("raw {}", response));
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_publish_order() {
        let dispatcher = EventDispatcher::start().unwrap();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());

        dispatcher.publish(ControllerEvent::CommandSent(Command::new("G0 X1")));
        dispatcher.publish(ControllerEvent::Console {
            level: MessageLevel::Info,
            text: ">>> G0 X1".to_string(),
        });
        dispatcher.publish(ControllerEvent::RawResponse("ok".to_string()));
        dispatcher.flush().await;

        assert_eq!(
            *recorder.seen.lock(),
            vec!["sent G0 X1", "console >>> G0 X1", "raw ok"]
        );
    }

    #[tokio::test]
    async fn test_publish_from_plain_thread() {
        let dispatcher = EventDispatcher::start().unwrap();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());

        let producer = dispatcher.clone();
        std::thread::spawn(move || {
            for i in 0..50 {
                producer.publish(ControllerEvent::RawResponse(i.to_string()));
            }
        })
        .join()
        .unwrap();
        dispatcher.flush().await;

        let seen = recorder.seen.lock().clone();
        let expected: Vec<String> = (0..50).map(|i| format!("raw {}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_unregister() {
        let dispatcher = EventDispatcher::start().unwrap();
        let recorder = Arc::new(Recorder::default());
        let handle = dispatcher.register(recorder.clone());
        assert_eq!(dispatcher.listener_count(), 1);
        assert!(dispatcher.unregister(&handle));
        assert!(!dispatcher.unregister(&handle));

        dispatcher.publish(ControllerEvent::RawResponse("ok".to_string()));
        dispatcher.flush().await;
        assert!(recorder.seen.lock().is_empty());
    }
}
