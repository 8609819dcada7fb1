//! Per-sensor records and board warnings

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::{Flag, SensorLabel, SensorStatus};

/// Everything known about one sensor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRecord {
    /// Sensor index, the only identity key
    pub index: usize,
    pub label: String,
    pub sensor_type: String,
    pub force_disable: String,
    pub low_setpoint: String,
    pub high_setpoint: String,
    /// Values refreshed by every status poll
    #[serde(flatten)]
    pub status: SensorStatus,
    /// An alarm was already raised for the current activation
    #[serde(skip)]
    pub alarm_notified: bool,
}

impl SensorRecord {
    /// Placeholder for an index not described by the labels reply yet
    pub fn empty(index: usize) -> Self {
        Self {
            index,
            status: SensorStatus {
                trigger: Flag::False,
                ..SensorStatus::default()
            },
            ..Self::default()
        }
    }

    /// Overwrite the static fields and reset everything volatile
    pub fn apply_label(&mut self, label: &SensorLabel) {
        self.index = label.index;
        self.label = label.label.clone();
        self.sensor_type = label.sensor_type.clone();
        self.force_disable = label.force_disable.clone();
        self.low_setpoint = label.low_setpoint.clone();
        self.high_setpoint = label.high_setpoint.clone();
        self.status = SensorStatus {
            trigger: Flag::False,
            ..SensorStatus::default()
        };
        self.alarm_notified = false;
    }
}

impl From<&SensorLabel> for SensorRecord {
    fn from(label: &SensorLabel) -> Self {
        let mut record = SensorRecord::empty(label.index);
        record.apply_label(label);
        record
    }
}

/// One of the four board health warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BoardWarning {
    /// Free SRAM is low
    Memory,
    /// Firmware update cycle is too slow
    ExecTime,
    /// Board temperature out of limits
    Temperature,
    /// Supply voltage out of limits
    Voltage,
}

impl BoardWarning {
    pub const ALL: [BoardWarning; 4] = [
        BoardWarning::Memory,
        BoardWarning::ExecTime,
        BoardWarning::Temperature,
        BoardWarning::Voltage,
    ];

    /// Operator message raised when the warning turns on
    pub fn message(&self) -> &'static str {
        match self {
            BoardWarning::Memory => "SafetyPrinter MCU low memory.",
            BoardWarning::ExecTime => "SafetyPrinter MCU high update cycle time.",
            BoardWarning::Temperature => {
                "SafetyPrinter MCU board temperature out of safe limits."
            }
            BoardWarning::Voltage => "SafetyPrinter MCU board supply voltage out of safe limits.",
        }
    }

    /// Temperature and voltage warnings can be muted by configuration
    pub fn is_environmental(&self) -> bool {
        matches!(self, BoardWarning::Temperature | BoardWarning::Voltage)
    }
}

impl fmt::Display for BoardWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BoardWarning::Memory => "memory",
            BoardWarning::ExecTime => "exec time",
            BoardWarning::Temperature => "temperature",
            BoardWarning::Voltage => "voltage",
        };
        f.write_str(name)
    }
}

/// Last reported state of the board warnings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardWarnings {
    pub memory: Flag,
    pub exec_time: Flag,
    pub temperature: Flag,
    pub voltage: Flag,
}

impl BoardWarnings {
    pub fn get(&self, warning: BoardWarning) -> Flag {
        match warning {
            BoardWarning::Memory => self.memory,
            BoardWarning::ExecTime => self.exec_time,
            BoardWarning::Temperature => self.temperature,
            BoardWarning::Voltage => self.voltage,
        }
    }

    pub fn set(&mut self, warning: BoardWarning, value: Flag) {
        match warning {
            BoardWarning::Memory => self.memory = value,
            BoardWarning::ExecTime => self.exec_time = value,
            BoardWarning::Temperature => self.temperature = value,
            BoardWarning::Voltage => self.voltage = value,
        }
    }

    /// Warnings currently raised
    pub fn active(&self) -> Vec<BoardWarning> {
        BoardWarning::ALL
            .into_iter()
            .filter(|w| self.get(*w).is_true())
            .collect()
    }
}
