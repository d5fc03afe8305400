//! Pure Modbus RTU frame building, parsing, and temperature decoding.
//!
//! Nothing in this module touches I/O; it only shapes and interprets bytes.
//! Function codes 3 (read holding), 4 (read input) and 6 (write single
//! holding) are the only ones this service speaks.

use thiserror::Error;

use super::crc::{crc16, push_crc};

pub const FUNC_READ_HOLDING: u8 = 0x03;
pub const FUNC_READ_INPUT: u8 = 0x04;
pub const FUNC_WRITE_SINGLE: u8 = 0x06;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModbusError {
    #[error("frame too short: expected at least {expected} bytes, got {got}")]
    FrameShort { expected: usize, got: usize },
    #[error("CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    CrcMismatch { computed: u16, received: u16 },
    #[error("echo mismatch: expected slave={expected_slave} func={expected_func:#04x}, got slave={got_slave} func={got_func:#04x}")]
    EchoMismatch {
        expected_slave: u8,
        expected_func: u8,
        got_slave: u8,
        got_func: u8,
    },
    #[error("device returned Modbus exception code {0:#04x}")]
    ModbusException(u8),
    #[error("cannot decode temperature: {reason}")]
    DecodeRange { reason: String },
}

/// Build a read request (function 3 or 4): slave, func, start register,
/// register count, followed by CRC-16/Modbus.
pub fn build_request(slave_id: u8, func_code: u8, start_reg: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave_id);
    frame.push(func_code);
    frame.extend_from_slice(&start_reg.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    push_crc(&mut frame);
    frame
}

/// Build a function-6 write-single-register request.
pub fn build_write_single(slave_id: u8, register: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave_id);
    frame.push(FUNC_WRITE_SINGLE);
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    push_crc(&mut frame);
    frame
}

/// The expected reply length in bytes for a read request given `count`
/// 16-bit registers: slave(1) + func(1) + byte_count(1) + data(2*count) + crc(2).
pub fn expected_read_reply_len(count: u16) -> usize {
    5 + (count as usize) * 2
}

/// The expected reply length for a function-6 write: it is an exact echo
/// of the request, 8 bytes.
pub fn expected_write_reply_len() -> usize {
    8
}

/// Verified, CRC-checked register payload extracted from a read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPayload {
    pub raw: Vec<u8>,
}

/// Parse and validate a read response against the request it answers.
pub fn parse_read_response(
    bytes: &[u8],
    expected_slave: u8,
    expected_func: u8,
) -> Result<ReadPayload, ModbusError> {
    if bytes.len() < 5 {
        return Err(ModbusError::FrameShort {
            expected: 5,
            got: bytes.len(),
        });
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 2);
    let received_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed_crc = crc16(body);
    if received_crc != computed_crc {
        return Err(ModbusError::CrcMismatch {
            computed: computed_crc,
            received: received_crc,
        });
    }

    let got_slave = bytes[0];
    let got_func = bytes[1];

    if got_func == (expected_func | 0x80) {
        let exception_code = bytes.get(2).copied().unwrap_or(0);
        return Err(ModbusError::ModbusException(exception_code));
    }

    if got_slave != expected_slave || got_func != expected_func {
        return Err(ModbusError::EchoMismatch {
            expected_slave,
            expected_func,
            got_slave,
            got_func,
        });
    }

    let byte_count = bytes[2] as usize;
    if bytes.len() != 3 + byte_count + 2 {
        return Err(ModbusError::FrameShort {
            expected: 3 + byte_count + 2,
            got: bytes.len(),
        });
    }

    Ok(ReadPayload {
        raw: bytes[3..3 + byte_count].to_vec(),
    })
}

/// Validate a function-6 write echo: the entire frame must equal the
/// request bytes that were sent (function 6 replies are exact echoes).
pub fn parse_write_echo(bytes: &[u8], request: &[u8]) -> Result<(), ModbusError> {
    if bytes.len() < 5 {
        return Err(ModbusError::FrameShort {
            expected: 5,
            got: bytes.len(),
        });
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 2);
    let received_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed_crc = crc16(body);
    if received_crc != computed_crc {
        return Err(ModbusError::CrcMismatch {
            computed: computed_crc,
            received: received_crc,
        });
    }

    if bytes[1] == (FUNC_WRITE_SINGLE | 0x80) {
        let exception_code = bytes.get(2).copied().unwrap_or(0);
        return Err(ModbusError::ModbusException(exception_code));
    }

    if bytes != request {
        return Err(ModbusError::EchoMismatch {
            expected_slave: request.first().copied().unwrap_or(0),
            expected_func: FUNC_WRITE_SINGLE,
            got_slave: bytes[0],
            got_func: bytes[1],
        });
    }

    Ok(())
}

/// A decoded temperature reading: the primary value and an optional
/// ambient value carried in the second register of a two-register layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedTemperature {
    pub value: f32,
    pub ambient: Option<f32>,
}

/// Hints about where ambient temperature lives in a two-register payload.
/// The decoder has no way to tell these two shapes apart from the bytes
/// alone, so the caller (the Scheduler, reading the per-device config)
/// supplies which one a given device uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterLayout {
    /// count = 1: signed 16-bit, divided by 10.
    SingleRegister,
    /// count = 2: big-endian IEEE-754 float occupying both registers, no
    /// ambient reading.
    FloatPair,
    /// count = 2: two independent signed 16-bit values, each divided by
    /// 10 — primary temperature in the first register, ambient in the
    /// second.
    SplitWithAmbient,
}

/// Decode raw register bytes into a temperature per §4.1's per-device rule.
pub fn decode_temperature(
    raw: &[u8],
    layout: RegisterLayout,
) -> Result<DecodedTemperature, ModbusError> {
    match layout {
        RegisterLayout::SingleRegister => {
            if raw.len() < 2 {
                return Err(ModbusError::DecodeRange {
                    reason: format!("need 2 bytes for single-register decode, got {}", raw.len()),
                });
            }
            let raw_i16 = i16::from_be_bytes([raw[0], raw[1]]);
            Ok(DecodedTemperature {
                value: raw_i16 as f32 / 10.0,
                ambient: None,
            })
        }
        RegisterLayout::FloatPair => {
            if raw.len() < 4 {
                return Err(ModbusError::DecodeRange {
                    reason: format!("need 4 bytes for float-pair decode, got {}", raw.len()),
                });
            }
            let value = f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if !value.is_finite() {
                return Err(ModbusError::DecodeRange {
                    reason: "decoded value is NaN or infinite".into(),
                });
            }
            Ok(DecodedTemperature {
                value,
                ambient: None,
            })
        }
        RegisterLayout::SplitWithAmbient => {
            if raw.len() < 4 {
                return Err(ModbusError::DecodeRange {
                    reason: format!("need 4 bytes for split-register decode, got {}", raw.len()),
                });
            }
            let value_i16 = i16::from_be_bytes([raw[0], raw[1]]);
            let ambient_i16 = i16::from_be_bytes([raw[2], raw[3]]);
            Ok(DecodedTemperature {
                value: value_i16 as f32 / 10.0,
                ambient: Some(ambient_i16 as f32 / 10.0),
            })
        }
    }
}

/// Encode a temperature back into two big-endian registers, the inverse of
/// the `FloatPair` branch of [`decode_temperature`]. Used by round-trip tests.
pub fn encode_temperature_float(value: f32) -> [u8; 4] {
    value.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_matches_known_frame() {
        let frame = build_request(1, FUNC_READ_HOLDING, 0, 1);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn round_trip_single_register_reading() {
        // value 30.0C -> raw i16 300 -> 0x012C
        let reply = {
            let mut f = vec![0x01, 0x03, 0x02, 0x01, 0x2C];
            push_crc(&mut f);
            f
        };
        let payload = parse_read_response(&reply, 1, FUNC_READ_HOLDING).unwrap();
        let decoded = decode_temperature(&payload.raw, RegisterLayout::SingleRegister).unwrap();
        assert_eq!(decoded.value, 30.0);
        assert_eq!(decoded.ambient, None);
    }

    #[test]
    fn round_trip_float_pair_reading() {
        let raw_bytes = encode_temperature_float(123.5);
        let mut reply = vec![0x01, 0x04, 0x04];
        reply.extend_from_slice(&raw_bytes);
        push_crc(&mut reply);
        let payload = parse_read_response(&reply, 1, FUNC_READ_INPUT).unwrap();
        let decoded = decode_temperature(&payload.raw, RegisterLayout::FloatPair).unwrap();
        assert_eq!(decoded.value, 123.5);
    }

    #[test]
    fn round_trip_split_register_reading_with_ambient() {
        // primary 30.0C -> 0x012C, ambient 25.5C -> 0x00FF
        let mut reply = vec![0x01, 0x03, 0x04, 0x01, 0x2C, 0x00, 0xFF];
        push_crc(&mut reply);
        let payload = parse_read_response(&reply, 1, FUNC_READ_HOLDING).unwrap();
        let decoded = decode_temperature(&payload.raw, RegisterLayout::SplitWithAmbient).unwrap();
        assert_eq!(decoded.value, 30.0);
        assert_eq!(decoded.ambient, Some(25.5));
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let mut reply: Vec<u8> = vec![0x01, 0x03, 0x02, 0x01, 0x2C, 0x00, 0x00];
        reply[5] = reply[5].wrapping_add(1);
        let err = parse_read_response(&reply, 1, FUNC_READ_HOLDING).unwrap_err();
        assert!(matches!(err, ModbusError::CrcMismatch { .. }));
    }

    #[test]
    fn exception_response_is_surfaced() {
        let mut reply = vec![0x01, FUNC_READ_HOLDING | 0x80, 0x02];
        push_crc(&mut reply);
        let err = parse_read_response(&reply, 1, FUNC_READ_HOLDING).unwrap_err();
        assert_eq!(err, ModbusError::ModbusException(0x02));
    }

    #[test]
    fn echo_mismatch_is_rejected() {
        let mut reply = vec![0x02, FUNC_READ_HOLDING, 0x02, 0x01, 0x2C];
        push_crc(&mut reply);
        let err = parse_read_response(&reply, 1, FUNC_READ_HOLDING).unwrap_err();
        assert!(matches!(err, ModbusError::EchoMismatch { .. }));
    }

    #[test]
    fn short_frame_is_rejected() {
        let err = parse_read_response(&[0x01, 0x03], 1, FUNC_READ_HOLDING).unwrap_err();
        assert!(matches!(err, ModbusError::FrameShort { .. }));
    }

    #[test]
    fn write_single_echo_round_trips() {
        let request = build_write_single(1, 0x0000, 95);
        parse_write_echo(&request, &request).unwrap();
    }
}
