//! Protocol module - framing and the command vocabulary.
//!
//! This module implements the wire protocol:
//! - 4-byte length header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Commands (`<opcode>:<args>`) and tagged responses

mod command;
mod frame_buffer;
mod response;
mod wire_format;

pub use command::{Command, InstrumentHandle, Opcode, SEPARATOR};
pub use frame_buffer::FrameBuffer;
pub use response::{
    decode_names, Response, ACK, ATTRIBUTE_ERROR_MARKER, FAILURE_SENTINEL, KIND_ATTRIBUTE_ERROR,
    KIND_HANDLES_EXHAUSTED, KIND_UNKNOWN_HANDLE, LIST_DELIMITER, SUCCESS_TAG,
};
pub use wire_format::{
    build_frame, Header, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
};

/// Render a payload for log output.
///
/// Printable ASCII is shown as text, anything else as hex.
pub fn render_payload(payload: &[u8]) -> String {
    if payload
        .iter()
        .all(|b| b.is_ascii_graphic() || *b == b' ')
    {
        String::from_utf8_lossy(payload).into_owned()
    } else {
        format!("0x{}", hex::encode(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_payload() {
        assert_eq!(render_payload(b"*IDN?"), "*IDN?");
        assert_eq!(render_payload(b""), "");
        assert_eq!(render_payload(&[0x00, 0xff, 0x10]), "0x00ff10");
        assert_eq!(render_payload(b"line\n"), "0x6c696e650a");
    }
}
