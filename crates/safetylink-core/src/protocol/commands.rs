//! Protocol commands
//!
//! Defines the commands understood by the Safety Printer MCU firmware.

use serde::{Deserialize, Serialize};

use super::{frame, ProtocolError};

/// Commands for MCU communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Interlock, board warnings and per-sensor status (`R1`)
    Status,

    /// Sensor labels, types and setpoint limits (`R2`)
    Labels,

    /// Firmware version and communication protocol (`R4`)
    FirmwareInfo,

    /// Board SRAM, temperature, voltage and cycle times (`R5`)
    McuStats,

    /// Identification request used during the handshake (`R6`)
    Identify,

    /// Reset all trips (`C1`)
    ResetTrips,

    /// Virtual emergency button (`C2`)
    ManualTrip,

    /// Enable or disable a sensor (`C3 idx on|off`)
    SetSensorEnabled { index: usize, enabled: bool },

    /// Change a sensor setpoint (`C4 idx value`)
    ChangeSetpoint { index: usize, setpoint: String },

    /// Persist the current configuration to EEPROM (`C5`)
    SaveConfig,

    /// Switch the printer power off (`C6 off`)
    PowerOff,

    /// Change a sensor trip timer (`C7 idx value`)
    ChangeTimer { index: usize, timer: String },

    /// Restore factory settings of a sensor (`C8 idx`)
    RestoreDefaults { index: usize },

    /// Put the MCU in a state where it can be reprogrammed (`C9 0`)
    PrepareReprogram,

    /// Free-form command typed by the operator, already in wire form
    Raw(String),
}

impl Command {
    /// Parse an operator-typed command such as `<C4 2 60>`.
    ///
    /// Only the frame shape is validated; the MCU rejects unknown IDs itself.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let trimmed = text.trim();
        match (trimmed.find('<'), trimmed.find('>')) {
            (Some(open), Some(close)) if close > open + 1 => Ok(Command::Raw(trimmed.to_string())),
            _ => Err(ProtocolError::InvalidCommand(trimmed.to_string())),
        }
    }

    /// Command ID as it appears on the wire (`R1`, `C4`, ...)
    pub fn id(&self) -> &str {
        match self {
            Command::Status => "R1",
            Command::Labels => "R2",
            Command::FirmwareInfo => "R4",
            Command::McuStats => "R5",
            Command::Identify => "R6",
            Command::ResetTrips => "C1",
            Command::ManualTrip => "C2",
            Command::SetSensorEnabled { .. } => "C3",
            Command::ChangeSetpoint { .. } => "C4",
            Command::SaveConfig => "C5",
            Command::PowerOff => "C6",
            Command::ChangeTimer { .. } => "C7",
            Command::RestoreDefaults { .. } => "C8",
            Command::PrepareReprogram => "C9",
            Command::Raw(wire) => frame::command_id(wire).unwrap_or(""),
        }
    }

    /// Encode the command as it is written to the port
    pub fn to_wire(&self) -> String {
        match self {
            Command::SetSensorEnabled { index, enabled } => {
                let state = if *enabled { "on" } else { "off" };
                frame::encode(self.id(), &[&index.to_string(), state])
            }
            Command::ChangeSetpoint { index, setpoint } => {
                frame::encode(self.id(), &[&index.to_string(), setpoint])
            }
            Command::ChangeTimer { index, timer } => {
                frame::encode(self.id(), &[&index.to_string(), timer])
            }
            Command::RestoreDefaults { index } => frame::encode(self.id(), &[&index.to_string()]),
            Command::PowerOff => frame::encode(self.id(), &["off"]),
            Command::PrepareReprogram => frame::encode(self.id(), &["0"]),
            Command::Raw(wire) => wire.clone(),
            _ => frame::encode(self.id(), &[]),
        }
    }

    /// Whether the reply carries a `$crc$` checksum segment
    pub fn is_checksummed(&self) -> bool {
        is_checksummed_id(self.id())
    }

    /// Diagnostic commands that stay available when the firmware speaks an
    /// incompatible protocol version
    pub fn bypasses_reduced_mode(&self) -> bool {
        matches!(self, Command::Identify | Command::FirmwareInfo)
    }
}

/// Reply IDs that carry a checksum segment
pub fn is_checksummed_id(id: &str) -> bool {
    matches!(
        id.to_ascii_uppercase().as_str(),
        "R1" | "R2" | "R4" | "R5"
    )
}
