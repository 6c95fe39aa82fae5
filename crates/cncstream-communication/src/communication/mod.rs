//! Transport layer
//!
//! A [`Connection`] moves raw bytes to and from the firmware. Outbound it
//! accepts whole lines and single real-time bytes; inbound it splits the
//! byte stream into lines and hands each one to a [`ResponseSink`] from
//! whatever thread it reads on.

pub mod buffered;
pub mod loopback;
pub mod serial;
pub mod source;

use cncstream_core::Result;
use std::sync::Arc;

/// Receives complete inbound lines from a connection
pub trait ResponseSink: Send + Sync {
    /// Called once per line, without the line terminator
    fn on_line(&self, line: &str);
}

impl<F> ResponseSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_line(&self, line: &str) {
        self(line)
    }
}

/// A byte-oriented link to the firmware
pub trait Connection: Send {
    /// Open the named port at the given rate, delivering inbound lines to `sink`
    fn open(&mut self, port: &str, baud_rate: u32, sink: Arc<dyn ResponseSink>) -> Result<()>;

    /// Close the port. Closing a closed connection is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Whether the link is open and still alive
    fn is_open(&self) -> bool;

    /// Write `text` followed by a newline
    fn write_line(&mut self, text: &str) -> Result<()>;

    /// Write a single raw byte outside of any line framing
    fn write_byte(&mut self, byte: u8) -> Result<()>;

    /// Name of the port this connection was opened on
    fn port_name(&self) -> Option<String> {
        None
    }
}

/// Splits an inbound byte stream into trimmed, non-empty lines.
///
/// Both `\n` and `\r` terminate a line so `\r\n` endings do not produce
/// empty lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                if !self.partial.is_empty() {
                    let line = String::from_utf8_lossy(&self.partial).trim().to_string();
                    self.partial.clear();
                    if !line.is_empty() {
                        lines.push(line);
                    }
                }
            } else {
                self.partial.push(b);
            }
        }
        lines
    }

    /// Discard any incomplete line
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_assembler_splits_and_trims() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"o").is_empty());
        assert_eq!(asm.push(b"k\r\n<Idle|MPos:0"), vec!["ok"]);
        assert_eq!(asm.push(b",0,0>\n\n  \n"), vec!["<Idle|MPos:0,0,0>"]);
    }

    #[test]
    fn test_line_assembler_clear() {
        let mut asm = LineAssembler::new();
        asm.push(b"garbage");
        asm.clear();
        assert_eq!(asm.push(b"ok\n"), vec!["ok"]);
    }
}
