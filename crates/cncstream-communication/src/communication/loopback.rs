//! In-memory connection
//!
//! Records everything written to it and lets the owner inject inbound
//! lines, so the controller can be driven without hardware.

use super::{Connection, ResponseSink};
use cncstream_core::{ConnectionError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct LoopbackState {
    open: bool,
    port: Option<String>,
    lines: Vec<String>,
    bytes: Vec<u8>,
    fail_writes: bool,
    sink: Option<Arc<dyn ResponseSink>>,
}

/// A [`Connection`] that talks to nothing
pub struct LoopbackConnection {
    state: Arc<Mutex<LoopbackState>>,
}

/// Shared view of a [`LoopbackConnection`] kept by the test or tool that
/// plays the firmware's part.
#[derive(Clone)]
pub struct LoopbackHandle {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackConnection {
    /// Create a connection and the handle used to drive it
    pub fn new() -> (Self, LoopbackHandle) {
        let state = Arc::new(Mutex::new(LoopbackState::default()));
        (
            Self {
                state: state.clone(),
            },
            LoopbackHandle { state },
        )
    }
}

impl Connection for LoopbackConnection {
    fn open(&mut self, port: &str, _baud_rate: u32, sink: Arc<dyn ResponseSink>) -> Result<()> {
        let mut state = self.state.lock();
        state.open = true;
        state.port = Some(port.to_string());
        state.sink = Some(sink);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.open = false;
        state.sink = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn write_line(&mut self, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ConnectionError::NotOpen.into());
        }
        if state.fail_writes {
            return Err(ConnectionError::WriteFailed {
                reason: "loopback write failure".to_string(),
            }
            .into());
        }
        state.lines.push(text.to_string());
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ConnectionError::NotOpen.into());
        }
        if state.fail_writes {
            return Err(ConnectionError::WriteFailed {
                reason: "loopback write failure".to_string(),
            }
            .into());
        }
        state.bytes.push(byte);
        Ok(())
    }

    fn port_name(&self) -> Option<String> {
        self.state.lock().port.clone()
    }
}

impl LoopbackHandle {
    /// Deliver a line as if the firmware had sent it.
    ///
    /// The sink runs on the calling thread, like a transport reader would.
    pub fn inject(&self, line: &str) {
        let sink = self.state.lock().sink.clone();
        match sink {
            Some(sink) => sink.on_line(line),
            None => tracing::warn!("Loopback not open, dropping injected line: {}", line),
        }
    }

    /// Lines written so far
    pub fn written_lines(&self) -> Vec<String> {
        self.state.lock().lines.clone()
    }

    /// Raw bytes written so far
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    /// Forget recorded traffic
    pub fn clear_written(&self) {
        let mut state = self.state.lock();
        state.lines.clear();
        state.bytes.clear();
    }

    /// Make every following write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Simulate the link dropping without a close
    pub fn drop_link(&self) {
        self.state.lock().open = false;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_traffic_and_injects() {
        let (mut conn, handle) = LoopbackConnection::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: Arc<dyn ResponseSink> =
            Arc::new(move |line: &str| sink_seen.lock().push(line.to_string()));

        assert!(conn.write_line("G0").is_err());
        conn.open("loop", 115200, sink).unwrap();
        conn.write_line("G0 X1").unwrap();
        conn.write_byte(b'?').unwrap();
        handle.inject("ok");

        assert_eq!(handle.written_lines(), vec!["G0 X1"]);
        assert_eq!(handle.written_bytes(), vec![b'?']);
        assert_eq!(*seen.lock(), vec!["ok"]);

        handle.set_fail_writes(true);
        assert!(conn.write_line("G0 X2").is_err());

        handle.drop_link();
        assert!(!conn.is_open());
    }
}
