//! Serial Protocol Communication
//!
//! Implements the Safety Printer MCU serial protocol: `<ID args>` commands,
//! `$crc$payload` checksummed replies, single-flight request/response
//! exchange and the connection lifecycle.

pub mod commands;
mod connection;
mod error;
pub mod exchange;
pub mod frame;
pub mod mock;
pub mod reply;
pub mod serial;
pub mod stream;

pub use commands::Command;
pub use connection::{Connection, ConnectionState, LinkState, ProtocolMode};
pub use error::ProtocolError;
pub use exchange::CommandExchange;
pub use reply::{
    parse_firmware_info, parse_labels, parse_mcu_stats, parse_status, FirmwareInfo, Flag,
    McuStats, ParseError, SensorLabel, SensorStatus, StatusReply, MAX_SENSORS,
};
pub use serial::{list_ports, PortInfo};
pub use stream::{LineChannel, PortBackend, SerialBackend, SerialChannel};

/// Default baud rate of the Safety Printer firmware
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Default serial read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 500;

/// Pause between reply line reads
pub const LINE_POLL_MS: u64 = 50;

/// Pause between retried exchanges
pub const RETRY_DELAY_MS: u64 = 500;

/// Exchange attempts before the connection is torn down
pub const MAX_RETRIES: u32 = 10;

/// Pause between handshake reads
pub const HANDSHAKE_POLL_MS: u64 = 500;

/// Handshake reads before giving up (about 20 seconds)
pub const HANDSHAKE_ATTEMPTS: u32 = 40;

/// Wait before asking the host to reconnect a printer reset by our port open
pub const HOST_RECONNECT_GRACE_MS: u64 = 10_000;

/// Text the firmware sends in answer to `<R6>`
pub const IDENTIFICATION_MARKER: &str = "R6: Safety Printer MCU";

/// Firmware communication protocol versions this host understands
pub const COMPATIBLE_PROTOCOLS: &[&str] = &["5"];
