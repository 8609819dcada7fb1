//! Serial port handling
//!
//! Discovers Safety Printer MCU boards among the OS serial devices and keeps
//! the printer's own port out of the candidate list.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::ProtocolError;

/// USB VID:PID pairs of the Arduino-compatible boards the firmware runs on
pub const KNOWN_BOARD_IDS: &[(u16, u16)] = &[
    (0x2341, 0x003D), // Arduino Due programming port
    (0x2341, 0x003F), // Arduino Mega ADK
    (0x2341, 0x0042), // Arduino Mega 2560 R3
    (0x2341, 0x0043), // Arduino Uno R3
    (0x2341, 0x0044), // Arduino Mega ADK R3
    (0x0403, 0x6001), // FTDI FT232R (Nano, Duemilanove)
    (0x0403, 0x6015), // FTDI FT231X
    (0x1A86, 0x5523), // WCH CH341
    (0x1A86, 0x7523), // WCH CH340
    (0x2341, 0x8036), // Arduino Leonardo
];

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

impl PortInfo {
    /// Whether the USB IDs match one of the known MCU boards
    pub fn is_known_board(&self) -> bool {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => KNOWN_BOARD_IDS.contains(&(vid, pid)),
            _ => false,
        }
    }
}

/// Ordering for the port list: known boards first, then CDC-ACM before
/// USB-serial adapters, numbered devices in numeric order
fn port_rank(port: &PortInfo) -> (bool, u8, u32, String) {
    let device = port.name.rsplit('/').next().unwrap_or(&port.name);
    let numbered = |prefix: &str| {
        device
            .strip_prefix(prefix)
            .map(|n| n.parse::<u32>().unwrap_or(u32::MAX))
    };
    let (family, number) = match (numbered("ttyACM"), numbered("ttyUSB")) {
        (Some(n), _) => (0, n),
        (_, Some(n)) => (1, n),
        _ => (2, 0),
    };
    (!port.is_known_board(), family, number, device.to_string())
}

/// Serial ports reported by the OS, known boards first
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by_key(port_rank);
    ports
}

/// Resolve symlinks (e.g. `/dev/serial/by-id/...`) to the real device path.
///
/// Paths that cannot be resolved are returned unchanged.
pub fn canonical_path(port: &str) -> String {
    fs::canonicalize(Path::new(port))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| port.to_string())
}

/// Keep the known boards, resolve their paths and drop duplicates
pub fn filter_candidates<F>(ports: Vec<PortInfo>, resolve: F) -> Vec<String>
where
    F: Fn(&str) -> String,
{
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for port in ports.into_iter().filter(PortInfo::is_known_board) {
        let resolved = resolve(&port.name);
        if seen.insert(resolved.clone()) {
            candidates.push(resolved);
        }
    }
    candidates
}

/// Enumerate OS serial devices that look like a Safety Printer MCU board
pub fn discover_candidate_ports() -> Vec<String> {
    let candidates = filter_candidates(list_ports(), canonical_path);
    tracing::debug!(?candidates, "MCU candidate ports");
    candidates
}

/// macOS exposes every device twice (`tty.*` and `cu.*`)
fn alternate_name(port: &str) -> Option<String> {
    if port.contains("tty.") {
        Some(port.replacen("tty.", "cu.", 1))
    } else if port.contains("cu.") {
        Some(port.replacen("cu.", "tty.", 1))
    } else {
        None
    }
}

/// Check whether `candidate` is the port the host printer is connected on.
///
/// Both paths are compared after `resolve`, including the alternate
/// `tty.`/`cu.` naming of the printer port.
pub fn is_host_printer_port<F>(candidate: &str, printer_port: Option<&str>, resolve: F) -> bool
where
    F: Fn(&str) -> String,
{
    let Some(printer_port) = printer_port else {
        return false;
    };
    let candidate = resolve(candidate);
    let printer = resolve(printer_port);
    if candidate == printer {
        return true;
    }
    alternate_name(&printer).is_some_and(|alt| alt == candidate)
}

/// Open a serial port with the given baud rate and read timeout
pub fn open_port(
    name: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn SerialPort>, ProtocolError> {
    serialport::new(name, baud_rate)
        .timeout(read_timeout)
        .open()
        .map_err(|e| ProtocolError::OpenFailed {
            port: name.to_string(),
            reason: e.to_string(),
        })
}

/// Put the port in 8N1 mode without flow control, as the MCU expects
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    let serial_err = |e: serialport::Error| ProtocolError::SerialError(e.to_string());
    port.set_data_bits(serialport::DataBits::Eight).map_err(serial_err)?;
    port.set_parity(serialport::Parity::None).map_err(serial_err)?;
    port.set_stop_bits(serialport::StopBits::One).map_err(serial_err)?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(serial_err)
}
