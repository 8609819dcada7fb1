//! Protocol errors

use thiserror::Error;

use super::reply::ParseError;

/// Errors that can occur while talking to the Safety Printer MCU
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Port discovery failed: {0}")]
    PortDiscovery(String),

    #[error("Failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("No answer from MCU after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },

    #[error("Could not decode MCU answer: {0}")]
    HandshakeDecode(String),

    #[error("Connected but no valid response")]
    NoValidResponse,

    #[error("Serial port is busy")]
    Busy,

    #[error("Received no data")]
    NoData,

    #[error("Bad checksum: MCU sent {received}, calculated {calculated} (payload: {payload})")]
    ChecksumMismatch {
        received: String,
        calculated: u16,
        payload: String,
    },

    #[error("Answer ({received}) doesn't match command ID {sent}")]
    IdMismatch { sent: String, received: String },

    #[error("Command {command} blocked: firmware communication protocol is incompatible")]
    Blocked { command: String },

    #[error("Command {command} failed after {attempts} attempts")]
    RetriesExhausted { command: String, attempts: u32 },

    #[error("Communication aborted")]
    Aborted,

    #[error("Not connected to the MCU")]
    NotConnected,

    #[error("'{0}' is not a valid command")]
    InvalidCommand(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Reply parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Flash tool error: {0}")]
    FlashTool(String),

    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Per-exchange failures that a retry may clear up
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::Busy
                | ProtocolError::NoData
                | ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::IdMismatch { .. }
                | ProtocolError::MalformedFrame(_)
                | ProtocolError::Parse(_)
        )
    }
}
