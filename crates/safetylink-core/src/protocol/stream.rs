//! Line-oriented transport abstraction
//!
//! The MCU speaks newline-terminated ASCII. `LineChannel` hides whether the
//! lines travel over a real serial port, the demo simulator or a test mock.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::serial::{canonical_path, configure_port, discover_candidate_ports, open_port};
use super::ProtocolError;

/// A bidirectional, line-oriented link to the MCU
pub trait LineChannel: Send {
    /// Write a complete frame
    fn write_frame(&mut self, frame: &str) -> io::Result<()>;

    /// Read one line, without its terminator.
    ///
    /// Returns whatever arrived before the read timeout expired, which is an
    /// empty buffer when the MCU stayed silent.
    fn read_line(&mut self) -> io::Result<Vec<u8>>;

    /// Discard any pending input
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Serial port wrapper implementing LineChannel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            pending: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

impl LineChannel for SerialChannel {
    fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        self.port.write_all(frame.as_bytes())?;
        self.port.flush()
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut buffer = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            match self.port.read(&mut buffer) {
                Ok(0) => return Ok(std::mem::take(&mut self.pending)),
                Ok(n) => self.pending.extend_from_slice(&buffer[..n]),
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    return Ok(std::mem::take(&mut self.pending));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Source of candidate ports and opened channels
pub trait PortBackend: Send + Sync {
    /// Candidate MCU ports, already resolved and de-duplicated
    fn discover(&self) -> Vec<String>;

    /// Open `port` and return a ready channel
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn LineChannel>, ProtocolError>;

    /// Canonical (symlink-resolved) form of a port path
    fn resolve(&self, port: &str) -> String {
        port.to_string()
    }
}

/// Backend for real serial hardware
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialBackend;

impl PortBackend for SerialBackend {
    fn discover(&self) -> Vec<String> {
        discover_candidate_ports()
    }

    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn LineChannel>, ProtocolError> {
        let mut serial = open_port(port, baud_rate, read_timeout)?;
        configure_port(serial.as_mut())?;
        Ok(Box::new(SerialChannel::new(serial)))
    }

    fn resolve(&self, port: &str) -> String {
        canonical_path(port)
    }
}
