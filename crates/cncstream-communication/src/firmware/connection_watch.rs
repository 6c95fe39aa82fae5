//! Connection watchdog
//!
//! Checks on a fixed interval whether the transport is still alive. When
//! the check fails the watchdog reports the loss once and stops; the
//! controller closes the connection in response. Every inbound line also
//! counts as a heartbeat so callers can see how long the firmware has been
//! quiet.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Liveness probe, true while the transport is open
pub type LivenessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Called once when the connection is found dead
pub type LostHandler = Arc<dyn Fn() + Send + Sync>;

/// Watchdog configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionWatchConfig {
    /// How often to check the transport
    pub check_interval_ms: u64,
    /// Whether the watchdog runs at all
    pub enabled: bool,
}

impl Default for ConnectionWatchConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 2000,
            enabled: true,
        }
    }
}

/// Watchdog view of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionWatchState {
    /// Not watching
    Stopped,
    /// Last check passed
    Healthy,
    /// A check failed and the loss was reported
    Lost,
}

/// Periodic liveness check for an open connection
pub struct ConnectionWatcher {
    config: ConnectionWatchConfig,
    runtime: Handle,
    state: Arc<RwLock<ConnectionWatchState>>,
    fired: Arc<AtomicBool>,
    last_heartbeat: Arc<Mutex<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionWatcher {
    pub fn new(config: ConnectionWatchConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            state: Arc::new(RwLock::new(ConnectionWatchState::Stopped)),
            fired: Arc::new(AtomicBool::new(false)),
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> ConnectionWatchConfig {
        self.config
    }

    /// Start watching, replacing any previous watch.
    ///
    /// Does nothing when the watchdog is disabled.
    pub fn start(&self, is_alive: LivenessCheck, on_lost: LostHandler) {
        self.stop();
        if !self.config.enabled {
            tracing::debug!("Connection watchdog disabled");
            return;
        }

        self.fired.store(false, Ordering::SeqCst);
        *self.state.write() = ConnectionWatchState::Healthy;
        self.heartbeat();

        let interval = Duration::from_millis(self.config.check_interval_ms.max(1));
        let state = self.state.clone();
        let fired = self.fired.clone();
        let task = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if is_alive() {
                    continue;
                }
                if fired.swap(true, Ordering::SeqCst) {
                    break;
                }
                tracing::warn!("Connection watchdog: transport is no longer open");
                *state.write() = ConnectionWatchState::Lost;
                on_lost();
                break;
            }
        });
        *self.task.lock() = Some(task);
    }

    /// Stop watching. Safe to call from inside the lost handler.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let mut state = self.state.write();
        if *state == ConnectionWatchState::Healthy {
            *state = ConnectionWatchState::Stopped;
        }
    }

    pub fn state(&self) -> ConnectionWatchState {
        *self.state.read()
    }

    /// Record traffic from the firmware
    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Milliseconds since the last heartbeat
    pub fn time_since_heartbeat(&self) -> u64 {
        self.last_heartbeat.lock().elapsed().as_millis() as u64
    }
}

impl Drop for ConnectionWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn watcher(check_interval_ms: u64) -> ConnectionWatcher {
        ConnectionWatcher::new(
            ConnectionWatchConfig {
                check_interval_ms,
                enabled: true,
            },
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_heartbeat_update() {
        let watcher = watcher(50);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(watcher.time_since_heartbeat() >= 50);
        watcher.heartbeat();
        assert!(watcher.time_since_heartbeat() <= 10);
    }

    #[tokio::test]
    async fn test_lost_fires_once() {
        let watcher = watcher(10);
        let alive = Arc::new(AtomicBool::new(true));
        let lost = Arc::new(AtomicUsize::new(0));

        let probe = alive.clone();
        let counter = lost.clone();
        watcher.start(
            Arc::new(move || probe.load(Ordering::SeqCst)),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(watcher.state(), ConnectionWatchState::Healthy);

        alive.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(watcher.state(), ConnectionWatchState::Lost);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_watcher_never_starts() {
        let watcher = ConnectionWatcher::new(
            ConnectionWatchConfig {
                check_interval_ms: 10,
                enabled: false,
            },
            Handle::current(),
        );
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = lost.clone();
        watcher.start(
            Arc::new(|| false),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(watcher.state(), ConnectionWatchState::Stopped);
        assert_eq!(lost.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_prevents_detection() {
        let watcher = watcher(10);
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = lost.clone();
        watcher.start(
            Arc::new(|| false),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        watcher.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lost.load(Ordering::SeqCst), 0);
        assert_eq!(watcher.state(), ConnectionWatchState::Stopped);
    }
}
