//! Frame encoding and checksum validation
//!
//! Commands travel as `<ID arg1 arg2...>`. Replies to the status-bearing
//! commands (`R1`, `R2`, `R4`, `R5`) are prefixed with a checksum segment:
//!
//! ```text
//! $<crc>$R1:F,F,F,F,F,#0,T,F,25.0,60.0,0,F,
//! ```
//!
//! The checksum is a CRC-16/ARC (reflected polynomial 0xA001, initial value
//! 0, no final XOR) over the payload that follows the second `$`. The MCU
//! computes the same value byte by byte.

use super::ProtocolError;

/// Reflected CRC-16 polynomial shared with the MCU firmware
const CRC16_POLY: u16 = 0xA001;

/// Checksum segment delimiter
const CRC_MARKER: char = '$';

/// Calculate the CRC-16/ARC of `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC16_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build the wire form of a command: `<ID arg1 arg2...>`
pub fn encode(command_id: &str, args: &[&str]) -> String {
    let mut wire = String::with_capacity(command_id.len() + 2 + args.len() * 4);
    wire.push('<');
    wire.push_str(command_id);
    for arg in args {
        wire.push(' ');
        wire.push_str(arg);
    }
    wire.push('>');
    wire
}

/// Prefix `payload` with its checksum segment, as the MCU does
pub fn wrap(payload: &str) -> String {
    format!("{CRC_MARKER}{}{CRC_MARKER}{payload}", crc16(payload.as_bytes()))
}

/// Validate the checksum segment of a raw reply and strip it.
///
/// Anything before the first `$` is kept and the checksum markers are
/// removed, so `$1234$R4:...` yields `R4:...`.
pub fn verify(raw: &str) -> Result<String, ProtocolError> {
    let first = raw
        .find(CRC_MARKER)
        .ok_or_else(|| ProtocolError::MalformedFrame(format!("missing checksum in '{raw}'")))?;
    let second = raw[first + 1..]
        .find(CRC_MARKER)
        .map(|pos| pos + first + 1)
        .ok_or_else(|| ProtocolError::MalformedFrame(format!("unterminated checksum in '{raw}'")))?;

    let received = &raw[first + 1..second];
    let payload = &raw[second + 1..];
    let calculated = crc16(payload.as_bytes());

    match received.parse::<u16>() {
        Ok(value) if value == calculated => {
            let mut stripped = String::with_capacity(first + payload.len());
            stripped.push_str(&raw[..first]);
            stripped.push_str(payload);
            Ok(stripped)
        }
        _ => Err(ProtocolError::ChecksumMismatch {
            received: received.to_string(),
            calculated,
            payload: payload.to_string(),
        }),
    }
}

/// Command ID of an outgoing frame: the text between `<` and the first
/// space or `>`
pub fn command_id(wire: &str) -> Option<&str> {
    let start = wire.find('<')? + 1;
    let end = wire.find('>')?;
    if end <= start {
        return None;
    }
    let inner = &wire[start..end];
    Some(inner.split(' ').next().unwrap_or(inner))
}

/// Command ID echoed at the start of a reply (everything before `:`)
pub fn response_id(payload: &str) -> &str {
    match payload.find(':') {
        Some(pos) => &payload[..pos],
        None => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/ARC catalogue check value
        assert_eq!(crc16(b"123456789"), 0xBB3D);
        assert_eq!(crc16(b""), 0);
        assert_eq!(crc16(b"A"), 12480);
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode("R1", &[]), "<R1>");
        assert_eq!(encode("C4", &["3", "55.0"]), "<C4 3 55.0>");
        assert_eq!(encode("C6", &["off"]), "<C6 off>");
    }

    #[test]
    fn test_verify_strips_checksum() {
        let raw = wrap("R4:2.0.0,2022-01-01,1024,5,Nano");
        assert_eq!(verify(&raw).unwrap(), "R4:2.0.0,2022-01-01,1024,5,Nano");
    }

    #[test]
    fn test_verify_known_frame() {
        let raw = "$57019$R1:F,F,F,F,F,#0,T,F,25.0,60.0,0,F,";
        assert_eq!(verify(raw).unwrap(), "R1:F,F,F,F,F,#0,T,F,25.0,60.0,0,F,");
    }

    #[test]
    fn test_verify_mismatch_reports_both_values() {
        let err = verify("$1$R1:F").unwrap_err();
        match err {
            ProtocolError::ChecksumMismatch {
                received,
                calculated,
                payload,
            } => {
                assert_eq!(received, "1");
                assert_eq!(calculated, crc16(b"R1:F"));
                assert_eq!(payload, "R1:F");
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_verify_non_numeric_checksum() {
        assert!(matches!(
            verify("$12a$R1:F"),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_missing_markers() {
        assert!(matches!(
            verify("R1:F,F"),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(matches!(
            verify("$123R1:F"),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_single_bit_flips_are_detected() {
        let payload = "R2:#0,Thermistor,1,F,0,280,#1,Door,2,F,0,1,";
        let framed = wrap(payload);
        let first_payload_byte = framed.rfind('$').unwrap() + 1;

        for pos in 1..framed.len() {
            if framed.as_bytes()[pos] == b'$' {
                continue;
            }
            for bit in 0..7 {
                let mut bytes = framed.clone().into_bytes();
                bytes[pos] ^= 1 << bit;
                if bytes[pos] == b'$' {
                    continue;
                }
                let corrupted = String::from_utf8(bytes).unwrap();
                let result = verify(&corrupted);
                assert!(
                    matches!(result, Err(ProtocolError::ChecksumMismatch { .. })),
                    "flip at {pos} bit {bit} (payload: {}) went undetected",
                    pos >= first_payload_byte
                );
            }
        }
    }

    #[test]
    fn test_command_id() {
        assert_eq!(command_id("<R1>"), Some("R1"));
        assert_eq!(command_id("<C4 3 55.0>"), Some("C4"));
        assert_eq!(command_id("<>"), None);
        assert_eq!(command_id("R1"), None);
    }

    #[test]
    fn test_response_id() {
        assert_eq!(response_id("R1:F,F"), "R1");
        assert_eq!(response_id("C1"), "C1");
        assert_eq!(response_id("C3: sensor disabled"), "C3");
    }
}
