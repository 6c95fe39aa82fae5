//! Serial port connection
//!
//! Opens the port with the `serialport` crate, writes on the caller's
//! thread and reads on a dedicated reader thread that feeds inbound lines
//! to the response sink.

use super::{Connection, LineAssembler, ResponseSink};
use cncstream_core::{ConnectionError, Result};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Serial port framing options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialOptions {
    pub data_bits: serialport::DataBits,
    pub stop_bits: serialport::StopBits,
    pub parity: serialport::Parity,
    pub flow_control: serialport::FlowControl,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            data_bits: serialport::DataBits::Eight,
            stop_bits: serialport::StopBits::One,
            parity: serialport::Parity::None,
            flow_control: serialport::FlowControl::None,
        }
    }
}

/// A [`Connection`] over a local serial port
pub struct SerialConnection {
    options: SerialOptions,
    port_name: Option<String>,
    writer: Option<Box<dyn serialport::SerialPort>>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialConnection {
    pub fn new() -> Self {
        Self::with_options(SerialOptions::default())
    }

    pub fn with_options(options: SerialOptions) -> Self {
        Self {
            options,
            port_name: None,
            writer: None,
            alive: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    fn spawn_reader(
        mut port: Box<dyn serialport::SerialPort>,
        sink: Arc<dyn ResponseSink>,
        alive: Arc<AtomicBool>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("cncstream-serial-reader".to_string())
            .spawn(move || {
                let mut assembler = LineAssembler::new();
                let mut buf = [0u8; 512];
                while !stop.load(Ordering::SeqCst) {
                    match port.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            for line in assembler.push(&buf[..n]) {
                                tracing::trace!("<< {}", line);
                                sink.on_line(&line);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::error!("Serial read failed, connection lost: {}", e);
                            alive.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                tracing::debug!("Serial reader thread exiting");
            })
    }

    fn writer(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotOpen.into());
        }
        self.writer
            .as_mut()
            .ok_or_else(|| ConnectionError::NotOpen.into())
    }
}

impl Default for SerialConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for SerialConnection {
    fn open(&mut self, port: &str, baud_rate: u32, sink: Arc<dyn ResponseSink>) -> Result<()> {
        if self.writer.is_some() {
            self.close()?;
        }

        let failed = |reason: String| ConnectionError::FailedToOpen {
            port: port.to_string(),
            reason,
        };

        let writer = serialport::new(port, baud_rate)
            .timeout(READ_TIMEOUT)
            .data_bits(self.options.data_bits)
            .stop_bits(self.options.stop_bits)
            .parity(self.options.parity)
            .flow_control(self.options.flow_control)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", port, e);
                failed(e.to_string())
            })?;
        let reader_port = writer.try_clone().map_err(|e| failed(e.to_string()))?;

        self.stop = Arc::new(AtomicBool::new(false));
        self.alive = Arc::new(AtomicBool::new(true));
        let reader = Self::spawn_reader(reader_port, sink, self.alive.clone(), self.stop.clone())
            .map_err(|e| failed(e.to_string()))?;

        tracing::info!("Opened serial port {} @ {} baud", port, baud_rate);
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.port_name = Some(port.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.writer.is_none() && self.reader.is_none() {
            return Ok(());
        }
        self.stop.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            // Not joined: the reader may be blocked delivering a line to a
            // sink that is waiting on whoever called close. It exits on its
            // next read timeout.
            if reader.is_finished() && reader.join().is_err() {
                tracing::warn!("Serial reader thread panicked");
            }
        }
        self.writer = None;
        if let Some(port) = self.port_name.take() {
            tracing::info!("Closed serial port {}", port);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.writer.is_some() && self.alive.load(Ordering::SeqCst)
    }

    fn write_line(&mut self, text: &str) -> Result<()> {
        let writer = self.writer()?;
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(b'\n');
        writer
            .write_all(&data)
            .and_then(|_| writer.flush())
            .map_err(|e| {
                ConnectionError::WriteFailed {
                    reason: e.to_string(),
                }
                .into()
            })
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        let writer = self.writer()?;
        writer
            .write_all(&[byte])
            .and_then(|_| writer.flush())
            .map_err(|e| {
                ConnectionError::WriteFailed {
                    reason: e.to_string(),
                }
                .into()
            })
    }

    fn port_name(&self) -> Option<String> {
        self.port_name.clone()
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_connection_rejects_writes() {
        let mut conn = SerialConnection::new();
        assert!(!conn.is_open());
        assert!(conn.write_line("G0 X1").is_err());
        assert!(conn.write_byte(b'?').is_err());
        assert!(conn.close().is_ok());
    }

    #[test]
    fn test_open_missing_port_fails() {
        let mut conn = SerialConnection::new();
        let sink: Arc<dyn ResponseSink> = Arc::new(|_: &str| {});
        let err = conn
            .open("/dev/cncstream-does-not-exist", 115200, sink)
            .unwrap_err();
        assert!(err.is_connection_error());
        assert!(!conn.is_open());
    }
}
