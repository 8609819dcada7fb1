//! Reply parsing
//!
//! Turns the comma-delimited payloads of the `R1`, `R2`, `R4` and `R5`
//! replies into typed values. Payloads are expected with the checksum
//! segment already stripped.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while tokenizing a reply payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected '{expected}:' prefix in '{payload}'")]
    MissingPrefix { expected: String, payload: String },

    #[error("missing field '{field}'")]
    MissingField { field: &'static str },

    #[error("invalid sensor index '{0}'")]
    InvalidIndex(String),

    #[error("sensor index {index} out of range for {count} sensors")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("{0} sensors reported, at most {MAX_SENSORS} supported")]
    TooManySensors(usize),
}

/// Most sensors a board can report
pub const MAX_SENSORS: usize = 64;

/// Ternary flag as sent by the MCU: `T`, `F`, or not yet known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Flag {
    True,
    False,
    #[default]
    Unknown,
}

impl Flag {
    /// Decode a wire token; anything other than `T`/`F` is unknown
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "T" => Flag::True,
            "F" => Flag::False,
            _ => Flag::Unknown,
        }
    }

    /// Wire form of the flag (empty when unknown)
    pub fn as_token(&self) -> &'static str {
        match self {
            Flag::True => "T",
            Flag::False => "F",
            Flag::Unknown => "",
        }
    }

    pub fn is_true(&self) -> bool {
        *self == Flag::True
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// Firmware identification from the `R4` reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub version: String,
    pub release_date: String,
    pub eeprom_size: String,
    pub comm_protocol_version: String,
    pub board_type: String,
    /// Whether `comm_protocol_version` is one this host understands
    pub is_compatible: bool,
}

impl FirmwareInfo {
    /// Mark the firmware compatible if its protocol version is listed
    pub fn check_compatibility<S: AsRef<str>>(&mut self, compatible: &[S]) -> bool {
        self.is_compatible = compatible
            .iter()
            .any(|v| v.as_ref() == self.comm_protocol_version);
        self.is_compatible
    }
}

/// Board statistics from the `R5` reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McuStats {
    pub sram: String,
    pub temperature: String,
    pub voltage: String,
    pub max_cycle_time: String,
    pub avg_cycle_time: String,
}

/// One `#index,label,type,forceDisable,lowSP,highSP,` group of the `R2` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorLabel {
    pub index: usize,
    pub label: String,
    pub sensor_type: String,
    pub force_disable: String,
    pub low_setpoint: String,
    pub high_setpoint: String,
}

/// Volatile sensor fields from one `#index,...` group of the `R1` reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorStatus {
    pub enabled: Flag,
    pub active: Flag,
    pub actual_value: String,
    pub setpoint: String,
    pub timer: String,
    pub trigger: Flag,
}

impl SensorStatus {
    /// Concatenation of the six volatile fields, used for change detection
    pub fn fingerprint(&self) -> String {
        let mut s = String::with_capacity(
            3 + self.actual_value.len() + self.setpoint.len() + self.timer.len(),
        );
        s.push_str(self.enabled.as_token());
        s.push_str(self.active.as_token());
        s.push_str(&self.actual_value);
        s.push_str(&self.setpoint);
        s.push_str(&self.timer);
        s.push_str(self.trigger.as_token());
        s
    }
}

/// Parsed `R1` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub interlock: Flag,
    pub memory_warning: Flag,
    pub exec_time_warning: Flag,
    pub temperature_warning: Flag,
    pub voltage_warning: Flag,
    pub sensors: Vec<(usize, SensorStatus)>,
}

/// Strip the `ID:` prefix from a payload
fn body<'a>(payload: &'a str, id: &str) -> Result<&'a str, ParseError> {
    payload
        .trim()
        .strip_prefix(id)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| ParseError::MissingPrefix {
            expected: id.to_string(),
            payload: payload.to_string(),
        })
}

/// Split the `#`-delimited groups of a reply body
fn groups(body: &str) -> impl Iterator<Item = &str> {
    body.split('#').skip(1)
}

fn parse_index(token: Option<&str>) -> Result<usize, ParseError> {
    let token = token.ok_or(ParseError::MissingField { field: "index" })?;
    let token = token.trim();
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidIndex(token.to_string()));
    }
    token
        .parse()
        .map_err(|_| ParseError::InvalidIndex(token.to_string()))
}

/// Indices must address one of the `count` reported groups
fn check_indices(indices: impl Iterator<Item = usize>, count: usize) -> Result<(), ParseError> {
    if count > MAX_SENSORS {
        return Err(ParseError::TooManySensors(count));
    }
    for index in indices {
        if index >= count {
            return Err(ParseError::IndexOutOfRange { index, count });
        }
    }
    Ok(())
}

fn field<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
    name: &'static str,
) -> Result<String, ParseError> {
    fields
        .next()
        .map(str::to_string)
        .ok_or(ParseError::MissingField { field: name })
}

/// Parse `R1:<interlock>,<mem>,<exec>,<temp>,<volt>,(#idx,en,act,val,sp,timer,trig,)*`
pub fn parse_status(payload: &str) -> Result<StatusReply, ParseError> {
    let body = body(payload, "R1")?;
    let header_end = body.find('#').unwrap_or(body.len());
    let mut header = body[..header_end].split(',');

    let mut flag = |name: &'static str| -> Result<Flag, ParseError> {
        header
            .next()
            .filter(|t| !t.is_empty())
            .map(Flag::from_token)
            .ok_or(ParseError::MissingField { field: name })
    };
    let interlock = flag("interlock")?;
    let memory_warning = flag("memory warning")?;
    let exec_time_warning = flag("exec time warning")?;
    let temperature_warning = flag("temperature warning")?;
    let voltage_warning = flag("voltage warning")?;

    let mut sensors = Vec::new();
    for group in groups(&body[header_end..]) {
        let mut fields = group.split(',');
        let index = parse_index(fields.next())?;
        let status = SensorStatus {
            enabled: Flag::from_token(&field(&mut fields, "enabled")?),
            active: Flag::from_token(&field(&mut fields, "active")?),
            actual_value: field(&mut fields, "actual value")?,
            setpoint: field(&mut fields, "setpoint")?,
            timer: field(&mut fields, "timer")?,
            trigger: Flag::from_token(&field(&mut fields, "trigger")?),
        };
        sensors.push((index, status));
    }
    check_indices(sensors.iter().map(|(index, _)| *index), sensors.len())?;

    Ok(StatusReply {
        interlock,
        memory_warning,
        exec_time_warning,
        temperature_warning,
        voltage_warning,
        sensors,
    })
}

/// Parse `R2:(#idx,label,type,forceDisable,lowSP,highSP,)*`
pub fn parse_labels(payload: &str) -> Result<Vec<SensorLabel>, ParseError> {
    let body = body(payload, "R2")?;
    let labels = groups(body)
        .map(|group| {
            let mut fields = group.split(',');
            Ok(SensorLabel {
                index: parse_index(fields.next())?,
                label: field(&mut fields, "label")?,
                sensor_type: field(&mut fields, "type")?,
                force_disable: field(&mut fields, "force disable")?,
                low_setpoint: field(&mut fields, "low setpoint")?,
                high_setpoint: field(&mut fields, "high setpoint")?,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;
    check_indices(labels.iter().map(|l| l.index), labels.len())?;
    Ok(labels)
}

/// Parse `R4:version,releaseDate,eeprom,commProtocol,boardType`
pub fn parse_firmware_info(payload: &str) -> Result<FirmwareInfo, ParseError> {
    let body = body(payload, "R4")?;
    let mut fields = body.split(',').map(str::trim);
    Ok(FirmwareInfo {
        version: field(&mut fields, "version")?,
        release_date: field(&mut fields, "release date")?,
        eeprom_size: field(&mut fields, "eeprom size")?,
        comm_protocol_version: field(&mut fields, "comm protocol")?,
        board_type: field(&mut fields, "board type")?,
        is_compatible: false,
    })
}

/// Parse `R5:sram,temp,volts,maxCycleTime,avgCycleTime`
pub fn parse_mcu_stats(payload: &str) -> Result<McuStats, ParseError> {
    let body = body(payload, "R5")?;
    let mut fields = body.split(',').map(str::trim);
    Ok(McuStats {
        sram: field(&mut fields, "sram")?,
        temperature: field(&mut fields, "temperature")?,
        voltage: field(&mut fields, "voltage")?,
        max_cycle_time: field(&mut fields, "max cycle time")?,
        avg_cycle_time: field(&mut fields, "avg cycle time")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_status() {
        let reply =
            parse_status("R1:F,T,F,F,F,#0,T,F,25.3,60.0,0,F,#1,T,T,1,0,5,T,").unwrap();
        assert_eq!(reply.interlock, Flag::False);
        assert_eq!(reply.memory_warning, Flag::True);
        assert_eq!(reply.sensors.len(), 2);

        let (index, sensor) = &reply.sensors[1];
        assert_eq!(*index, 1);
        assert_eq!(
            *sensor,
            SensorStatus {
                enabled: Flag::True,
                active: Flag::True,
                actual_value: "1".to_string(),
                setpoint: "0".to_string(),
                timer: "5".to_string(),
                trigger: Flag::True,
            }
        );
    }

    #[test]
    fn test_parse_status_without_sensors() {
        let reply = parse_status("R1:T,F,F,F,F,").unwrap();
        assert_eq!(reply.interlock, Flag::True);
        assert!(reply.sensors.is_empty());
    }

    #[test]
    fn test_parse_status_errors() {
        assert!(matches!(
            parse_status("R2:F,F,F,F,F,"),
            Err(ParseError::MissingPrefix { .. })
        ));
        assert_eq!(
            parse_status("R1:F,F,F,"),
            Err(ParseError::MissingField {
                field: "temperature warning"
            })
        );
        assert_eq!(
            parse_status("R1:F,F,F,F,F,#x,T,F,1,2,3,F,"),
            Err(ParseError::InvalidIndex("x".to_string()))
        );
        assert_eq!(
            parse_status("R1:F,F,F,F,F,#0,T,F"),
            Err(ParseError::MissingField {
                field: "actual value"
            })
        );
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels("R2:#0,Hotend Temp,1,F,0,280,#1,Door,2,T,0,1,").unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].label, "Hotend Temp");
        assert_eq!(labels[0].high_setpoint, "280");
        assert_eq!(labels[1].index, 1);
        assert_eq!(labels[1].force_disable, "T");
    }

    #[test]
    fn test_parse_labels_rejects_out_of_range_index() {
        assert_eq!(
            parse_labels("R2:#2000000,X,1,F,0,1,"),
            Err(ParseError::IndexOutOfRange {
                index: 2_000_000,
                count: 1
            })
        );
        // Two groups, second one skips ahead
        assert_eq!(
            parse_labels("R2:#0,Hotend,1,F,0,280,#5,Door,2,T,0,1,"),
            Err(ParseError::IndexOutOfRange { index: 5, count: 2 })
        );
        // Out of order is fine as long as every index is covered
        let labels = parse_labels("R2:#1,Door,2,T,0,1,#0,Hotend,1,F,0,280,").unwrap();
        assert_eq!(labels[0].index, 1);
    }

    #[test]
    fn test_parse_status_rejects_out_of_range_index() {
        assert_eq!(
            parse_status("R1:F,F,F,F,F,#3,T,F,1,2,3,F,"),
            Err(ParseError::IndexOutOfRange { index: 3, count: 1 })
        );
    }

    #[test]
    fn test_too_many_sensors() {
        let payload: String = (0..=MAX_SENSORS)
            .map(|i| format!("#{i},S{i},1,F,0,1,"))
            .collect();
        assert_eq!(
            parse_labels(&format!("R2:{payload}")),
            Err(ParseError::TooManySensors(MAX_SENSORS + 1))
        );
    }

    #[test]
    fn test_parse_firmware_info() {
        let mut info = parse_firmware_info("R4:2.0.3,Jan 10 2022,1024,5,Nano").unwrap();
        assert_eq!(info.version, "2.0.3");
        assert_eq!(info.release_date, "Jan 10 2022");
        assert_eq!(info.board_type, "Nano");
        assert!(info.check_compatibility(&["5"]));
        assert!(!info.check_compatibility(&["4", "6"]));

        assert!(parse_firmware_info("R4:2.0.3,Jan 10 2022").is_err());
    }

    #[test]
    fn test_parse_mcu_stats() {
        let stats = parse_mcu_stats("R5:812,35.2,4.98,120,80").unwrap();
        assert_eq!(stats.sram, "812");
        assert_eq!(stats.avg_cycle_time, "80");
    }

    #[test]
    fn test_fingerprint_changes_with_any_field() {
        let a = SensorStatus {
            enabled: Flag::True,
            active: Flag::False,
            actual_value: "25.0".to_string(),
            setpoint: "60".to_string(),
            timer: "0".to_string(),
            trigger: Flag::False,
        };
        let mut b = a.clone();
        b.timer = "1".to_string();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }
}
