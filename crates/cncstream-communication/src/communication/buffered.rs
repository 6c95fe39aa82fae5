//! Buffered command streamer with flow control and acknowledgment tracking
//!
//! Implements character-counting flow control: the streamer keeps a running
//! total of the bytes it has sent that the firmware has not acknowledged
//! yet, and only sends the next command when it fits in the firmware's
//! receive buffer.
//!
//! # Features
//! - Direct command queue that always drains before bulk streams
//! - Lazily consumed stream sources
//! - Receive buffer accounting
//! - FIFO acknowledgment tracking
//! - Single-step mode, forced automatically around exclusive commands
//! - Pause/resume and cancel

use crate::communication::source::CommandSource;
use crate::communication::Connection;
use cncstream_core::{Command, CommandNumberGenerator, Result};
use std::collections::VecDeque;

/// Response recorded on commands that can never fit in the receive buffer.
pub const OVERSIZED_RESPONSE: &str = "<command exceeds firmware receive buffer>";

/// Configuration for buffered streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamerConfig {
    /// Size of the firmware's receive buffer in bytes
    pub buffer_size: usize,
    /// Send one command at a time
    pub single_step: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 128,
            single_step: false,
        }
    }
}

/// Something the streamer did during a pump
#[derive(Debug, Clone, PartialEq)]
pub enum StreamerEvent {
    /// The command was written to the transport
    Sent(Command),
    /// The command had nothing to send and was dropped
    Skipped(Command),
    /// The command can never fit in the receive buffer and was dropped
    Rejected(Command),
    /// A stream source failed to read; its unread rows were dropped
    SourceFailed {
        source: String,
        unread_rows: usize,
        error: String,
    },
}

/// Predicate marking commands that must be the only command in flight
pub type ExclusiveFilter = fn(&str) -> bool;

/// Flow-controlled command streamer
pub struct BufferedStreamer {
    connection: Box<dyn Connection>,
    config: StreamerConfig,
    numbers: CommandNumberGenerator,
    exclusive_filter: Option<ExclusiveFilter>,
    /// Next command, already taken from a queue but not yet sendable
    pending: Option<Command>,
    /// Directly queued commands
    queue: VecDeque<Command>,
    /// Bulk sources, consumed in order after the direct queue
    streams: VecDeque<Box<dyn CommandSource>>,
    /// Sent, not yet acknowledged
    active: VecDeque<Command>,
    sent_buffer_size: usize,
    paused: bool,
}

impl BufferedStreamer {
    pub fn new(connection: Box<dyn Connection>, config: StreamerConfig) -> Self {
        Self {
            connection,
            config,
            numbers: CommandNumberGenerator::new(),
            exclusive_filter: None,
            pending: None,
            queue: VecDeque::new(),
            streams: VecDeque::new(),
            active: VecDeque::new(),
            sent_buffer_size: 0,
            paused: false,
        }
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> &mut dyn Connection {
        self.connection.as_mut()
    }

    /// Queue a single command ahead of any stream
    pub fn enqueue_command(&mut self, command: Command) {
        self.queue.push_back(command);
    }

    /// Attach a bulk source, consumed after the direct queue drains
    pub fn enqueue_stream(&mut self, source: Box<dyn CommandSource>) {
        self.streams.push_back(source);
    }

    /// Write a real-time byte outside of buffer accounting
    pub fn send_byte_immediately(&mut self, byte: u8) -> Result<()> {
        tracing::debug!(">> 0x{:02x}", byte);
        self.connection.write_byte(byte)
    }

    /// Send as many commands as flow control allows.
    ///
    /// A transport write failure is returned immediately; the failed command
    /// is not counted as sent and nothing further is attempted.
    pub fn pump(&mut self) -> Result<Vec<StreamerEvent>> {
        let mut events = Vec::new();
        while !self.paused {
            let Some(mut next) = self.take_next(&mut events) else {
                break;
            };

            if next.is_empty() {
                next.mark_skipped(self.numbers.next());
                events.push(StreamerEvent::Skipped(next));
                continue;
            }

            if next.wire_len() > self.config.buffer_size {
                tracing::warn!(
                    "Dropping command longer than the {} byte receive buffer: {}",
                    self.config.buffer_size,
                    next.text
                );
                next.mark_skipped(self.numbers.next());
                next.complete(OVERSIZED_RESPONSE, true);
                events.push(StreamerEvent::Rejected(next));
                continue;
            }

            if !self.can_send(&next) {
                self.pending = Some(next);
                break;
            }

            if let Err(e) = self.connection.write_line(&next.text) {
                tracing::error!("Failed to send '{}': {}", next.text, e);
                return Err(e);
            }
            next.mark_sent(self.numbers.next());
            self.sent_buffer_size += next.wire_len();
            tracing::debug!(
                ">> {} (buffer {}/{})",
                next.text,
                self.sent_buffer_size,
                self.config.buffer_size
            );
            self.active.push_back(next.clone());
            events.push(StreamerEvent::Sent(next));
        }
        Ok(events)
    }

    fn take_next(&mut self, events: &mut Vec<StreamerEvent>) -> Option<Command> {
        if let Some(cmd) = self.pending.take() {
            return Some(cmd);
        }
        let mut cmd = match self.queue.pop_front() {
            Some(cmd) => cmd,
            None => self.next_from_streams(events)?,
        };
        if let Some(filter) = self.exclusive_filter {
            cmd.exclusive |= filter(&cmd.text);
        }
        Some(cmd)
    }

    fn next_from_streams(&mut self, events: &mut Vec<StreamerEvent>) -> Option<Command> {
        while let Some(stream) = self.streams.front_mut() {
            match stream.next_command() {
                Ok(Some(cmd)) => return Some(cmd),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Stream {} failed: {}", stream.name(), e);
                    events.push(StreamerEvent::SourceFailed {
                        source: stream.name(),
                        unread_rows: stream.rows_remaining(),
                        error: e.to_string(),
                    });
                }
            }
            self.streams.pop_front();
        }
        None
    }

    fn can_send(&self, next: &Command) -> bool {
        if self.sent_buffer_size + next.wire_len() > self.config.buffer_size {
            return false;
        }
        let one_at_a_time = self.is_single_step() || next.exclusive;
        !one_at_a_time || self.active.is_empty()
    }

    /// Pop the oldest active command on an acknowledgment
    pub fn acknowledge(&mut self) -> Option<Command> {
        let cmd = self.active.pop_front()?;
        self.sent_buffer_size = self.sent_buffer_size.saturating_sub(cmd.wire_len());
        tracing::trace!(
            "ack {} (buffer {}/{})",
            cmd.text,
            self.sent_buffer_size,
            self.config.buffer_size
        );
        Some(cmd)
    }

    /// Stop sending until resumed. In-flight commands are unaffected.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Allow sending again. Call [`pump`](Self::pump) afterwards.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Drop everything not yet sent and clear the pause flag.
    ///
    /// Active commands stay; their acknowledgments are still expected.
    pub fn cancel(&mut self) {
        self.pending = None;
        self.queue.clear();
        self.streams.clear();
        self.paused = false;
    }

    /// Forget in-flight commands after the firmware has been reset
    pub fn reset(&mut self) {
        self.active.clear();
        self.sent_buffer_size = 0;
    }

    /// Restart command numbering for a new session
    pub fn reset_command_numbers(&mut self) {
        self.numbers.reset();
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Single-step as configured, or forced while an exclusive command is
    /// outstanding
    pub fn is_single_step(&self) -> bool {
        self.config.single_step || self.active.iter().any(|c| c.exclusive)
    }

    /// Configured single-step mode, ignoring any forced mode
    pub fn single_step(&self) -> bool {
        self.config.single_step
    }

    pub fn set_single_step(&mut self, enabled: bool) {
        self.config.single_step = enabled;
    }

    pub fn set_exclusive_filter(&mut self, filter: Option<ExclusiveFilter>) {
        self.exclusive_filter = filter;
    }

    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    pub fn set_buffer_size(&mut self, size: usize) {
        self.config.buffer_size = size;
    }

    pub fn sent_buffer_size(&self) -> usize {
        self.sent_buffer_size
    }

    /// Get the current buffer usage as a percentage
    pub fn buffer_usage_percent(&self) -> u32 {
        if self.config.buffer_size == 0 {
            return 0;
        }
        ((self.sent_buffer_size as f64 / self.config.buffer_size as f64) * 100.0) as u32
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_active_commands(&self) -> bool {
        !self.active.is_empty()
    }

    /// Oldest unacknowledged command
    pub fn active_command(&self) -> Option<&Command> {
        self.active.front()
    }

    /// Comma separated text of the active commands
    pub fn active_summary(&self) -> String {
        self.active
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Rows not yet sent, counting the pending command, the direct queue
    /// and the unread part of every stream
    pub fn queued_count(&self) -> usize {
        usize::from(self.pending.is_some())
            + self.queue.len()
            + self
                .streams
                .iter()
                .map(|s| s.rows_remaining())
                .sum::<usize>()
    }

    /// True when nothing is waiting to be sent
    pub fn is_drained(&self) -> bool {
        self.queued_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::loopback::{LoopbackConnection, LoopbackHandle};
    use crate::communication::source::LineSource;
    use crate::communication::ResponseSink;
    use std::sync::Arc;

    fn streamer(buffer_size: usize, single_step: bool) -> (BufferedStreamer, LoopbackHandle) {
        let (mut conn, handle) = LoopbackConnection::new();
        let sink: Arc<dyn ResponseSink> = Arc::new(|_: &str| {});
        conn.open("loop", 115200, sink).unwrap();
        let streamer = BufferedStreamer::new(
            Box::new(conn),
            StreamerConfig {
                buffer_size,
                single_step,
            },
        );
        (streamer, handle)
    }

    fn sent_texts(events: &[StreamerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamerEvent::Sent(c) => Some(c.text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_second_command_waits_for_room() {
        let (mut s, wire) = streamer(10, false);
        s.enqueue_command(Command::new("G1X1"));
        s.enqueue_command(Command::new("G1Y10"));

        let events = s.pump().unwrap();
        assert_eq!(sent_texts(&events), vec!["G1X1"]);
        assert_eq!(s.sent_buffer_size(), 5);
        assert_eq!(wire.written_lines(), vec!["G1X1"]);

        // Pumping again without an ack sends nothing.
        assert!(s.pump().unwrap().is_empty());

        let acked = s.acknowledge().unwrap();
        assert_eq!(acked.text, "G1X1");
        let events = s.pump().unwrap();
        assert_eq!(sent_texts(&events), vec!["G1Y10"]);
        assert_eq!(s.sent_buffer_size(), 6);
    }

    #[test]
    fn test_single_step_sends_one_at_a_time() {
        let (mut s, wire) = streamer(128, true);
        for cmd in ["G0 X1", "G0 X2", "G0 X3"] {
            s.enqueue_command(Command::new(cmd));
        }

        for expected in ["G0 X1", "G0 X2", "G0 X3"] {
            let events = s.pump().unwrap();
            assert_eq!(sent_texts(&events), vec![expected]);
            assert_eq!(s.active_count(), 1);
            assert!(s.pump().unwrap().is_empty());
            s.acknowledge();
        }
        assert_eq!(wire.written_lines().len(), 3);
    }

    #[test]
    fn test_direct_queue_before_stream() {
        let (mut s, wire) = streamer(128, false);
        s.enqueue_stream(Box::new(LineSource::new(["G1 X1", "G1 X2"])));
        s.enqueue_command(Command::new("G21"));
        s.pump().unwrap();
        assert_eq!(wire.written_lines(), vec!["G21", "G1 X1", "G1 X2"]);
    }

    #[test]
    fn test_empty_lines_are_skipped() {
        let (mut s, wire) = streamer(128, false);
        s.enqueue_stream(Box::new(LineSource::new(["(header)", "", "G0 X0"])));
        let events = s.pump().unwrap();
        let skipped = events
            .iter()
            .filter(|e| matches!(e, StreamerEvent::Skipped(_)))
            .count();
        assert_eq!(skipped, 2);
        assert_eq!(wire.written_lines(), vec!["G0 X0"]);
        assert_eq!(s.active_count(), 1);
    }

    #[test]
    fn test_pause_and_resume() {
        let (mut s, wire) = streamer(128, false);
        s.pause();
        s.enqueue_command(Command::new("G0 X1"));
        assert!(s.pump().unwrap().is_empty());
        assert!(wire.written_lines().is_empty());
        s.resume();
        assert_eq!(sent_texts(&s.pump().unwrap()), vec!["G0 X1"]);
    }

    #[test]
    fn test_cancel_keeps_active_commands() {
        let (mut s, _wire) = streamer(12, false);
        for cmd in ["G0 X1", "G0 X2", "G0 X3", "G0 X4"] {
            s.enqueue_command(Command::new(cmd));
        }
        s.pump().unwrap();
        assert_eq!(s.active_count(), 2);
        assert_eq!(s.queued_count(), 2);

        s.pause();
        s.cancel();
        assert!(!s.is_paused());
        assert_eq!(s.queued_count(), 0);
        assert_eq!(s.active_count(), 2);

        s.reset();
        assert_eq!(s.active_count(), 0);
        assert_eq!(s.sent_buffer_size(), 0);
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let (mut s, wire) = streamer(128, false);
        wire.set_fail_writes(true);
        s.enqueue_command(Command::new("G0 X1"));
        assert!(s.pump().is_err());
        assert_eq!(s.active_count(), 0);
        assert_eq!(s.sent_buffer_size(), 0);
    }

    #[test]
    fn test_exclusive_command_forces_single_step() {
        let (mut s, wire) = streamer(128, false);
        s.set_exclusive_filter(Some(|text: &str| text.starts_with("$1")));
        s.enqueue_command(Command::new("G0 X1"));
        s.enqueue_command(Command::new("$10=1"));
        s.enqueue_command(Command::new("G0 X2"));

        s.pump().unwrap();
        assert_eq!(wire.written_lines(), vec!["G0 X1"]);

        s.acknowledge();
        s.pump().unwrap();
        assert_eq!(wire.written_lines(), vec!["G0 X1", "$10=1"]);
        assert!(s.is_single_step());
        assert!(!s.single_step());

        s.acknowledge();
        s.pump().unwrap();
        assert_eq!(wire.written_lines(), vec!["G0 X1", "$10=1", "G0 X2"]);
        assert!(!s.is_single_step());
    }

    #[test]
    fn test_oversized_command_is_rejected() {
        let (mut s, wire) = streamer(8, false);
        s.enqueue_command(Command::new("G1 X100 Y100"));
        s.enqueue_command(Command::new("G0 X1"));
        let events = s.pump().unwrap();
        assert!(matches!(&events[0], StreamerEvent::Rejected(c) if c.is_error()));
        assert_eq!(wire.written_lines(), vec!["G0 X1"]);
    }

    #[test]
    fn test_real_time_byte_bypasses_accounting() {
        let (mut s, wire) = streamer(128, false);
        s.send_byte_immediately(b'?').unwrap();
        assert_eq!(wire.written_bytes(), vec![b'?']);
        assert_eq!(s.sent_buffer_size(), 0);
    }

    #[test]
    fn test_buffer_usage_percent() {
        let (mut s, _wire) = streamer(100, false);
        s.enqueue_command(Command::new("G0 X10 Y10"));
        s.pump().unwrap();
        assert_eq!(s.buffer_usage_percent(), 11);
    }

    /// Source that yields its lines and then fails
    struct BrokenSource {
        lines: VecDeque<&'static str>,
        unread: usize,
    }

    impl CommandSource for BrokenSource {
        fn next_command(&mut self) -> Result<Option<Command>> {
            match self.lines.pop_front() {
                Some(line) => Ok(Some(Command::new(line))),
                None => Err(std::io::Error::other("disk unplugged").into()),
            }
        }

        fn total_rows(&self) -> usize {
            self.lines.len() + self.unread
        }

        fn rows_remaining(&self) -> usize {
            self.lines.len() + self.unread
        }
    }

    #[test]
    fn test_failed_source_is_reported_and_dropped() {
        let (mut s, wire) = streamer(128, false);
        s.enqueue_stream(Box::new(BrokenSource {
            lines: VecDeque::from(["G0 X1"]),
            unread: 3,
        }));
        s.enqueue_stream(Box::new(LineSource::new(["G0 X2"])));
        let events = s.pump().unwrap();

        assert!(events.iter().any(|e| matches!(
            e,
            StreamerEvent::SourceFailed { unread_rows: 3, error, .. } if error.contains("disk unplugged")
        )));
        assert_eq!(wire.written_lines(), vec!["G0 X1", "G0 X2"]);
        assert!(s.is_drained());
    }
}
