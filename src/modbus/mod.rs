pub mod codec;
pub mod crc;

pub use codec::{
    build_request, build_write_single, decode_temperature, expected_read_reply_len,
    expected_write_reply_len, parse_read_response, parse_write_echo, DecodedTemperature,
    ModbusError, ReadPayload, RegisterLayout, FUNC_READ_HOLDING, FUNC_READ_INPUT,
    FUNC_WRITE_SINGLE,
};
