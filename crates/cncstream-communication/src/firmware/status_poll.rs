//! Periodic status polling
//!
//! The poller fires a callback on a fixed interval. The callback decides
//! whether a request actually goes out: it is skipped while a previous
//! request is still unanswered, and after too many unanswered ticks the
//! outstanding count is cleared so a lost response cannot stall polling.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Callback invoked on every poll tick
pub type PollTick = Arc<dyn Fn() + Send + Sync>;

/// Ticks without a status response before the outstanding count is cleared
pub const MAX_UNANSWERED_TICKS: u32 = 20;

/// Tracks status requests that have not been answered yet
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingPolls {
    count: u32,
}

impl OutstandingPolls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one tick. Returns true when a request should be sent now.
    pub fn tick(&mut self) -> bool {
        if self.count == 0 {
            self.count = 1;
            return true;
        }
        self.count += 1;
        if self.count >= MAX_UNANSWERED_TICKS {
            tracing::debug!("No status response after {} polls, retrying", self.count);
            self.count = 0;
        }
        false
    }

    /// A status report arrived
    pub fn received(&mut self) {
        self.count = 0;
    }

    pub fn outstanding(&self) -> u32 {
        self.count
    }
}

/// Runs a [`PollTick`] on a tokio interval
pub struct StatusPoller {
    runtime: Handle,
    task: Option<JoinHandle<()>>,
    interval: Option<Duration>,
}

impl StatusPoller {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            task: None,
            interval: None,
        }
    }

    /// Start polling, replacing any running timer.
    pub fn start(&mut self, interval: Duration, tick: PollTick) {
        self.stop();
        let interval = interval.max(Duration::from_millis(1));
        tracing::debug!("Starting status poll every {:?}", interval);
        self.task = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tick();
            }
        }));
        self.interval = Some(interval);
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Stopped status poll");
        }
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_outstanding_polls() {
        let mut polls = OutstandingPolls::new();
        assert!(polls.tick());
        assert_eq!(polls.outstanding(), 1);
        assert!(!polls.tick());
        polls.received();
        assert!(polls.tick());
    }

    #[test]
    fn test_unanswered_polls_reset() {
        let mut polls = OutstandingPolls::new();
        assert!(polls.tick());
        for _ in 1..MAX_UNANSWERED_TICKS {
            assert!(!polls.tick());
        }
        assert_eq!(polls.outstanding(), 0);
        assert!(polls.tick());
    }

    #[tokio::test]
    async fn test_poller_ticks_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut poller = StatusPoller::new(Handle::current());
        poller.start(
            Duration::from_millis(10),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(poller.is_running());
        assert_eq!(poller.interval(), Some(Duration::from_millis(10)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        poller.stop();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, got {}", seen);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert!(!poller.is_running());
    }
}
