//! Responses and their tagged wire encoding.
//!
//! Every response payload starts with a type tag so a success payload can
//! never be mistaken for a failure:
//! ```text
//! +<payload>                 success
//! !!<error-kind>:<message>   failure
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::command::InstrumentHandle;
use crate::error::{Error, Result};

/// Leading byte of a success response.
pub const SUCCESS_TAG: u8 = b'+';

/// Leading bytes of a failure response.
pub const FAILURE_SENTINEL: &[u8; 2] = b"!!";

/// Acknowledgement payload for commands with no result.
pub const ACK: &[u8] = b"Success";

/// Success payload of `GetAttr` when the attribute does not exist.
pub const ATTRIBUTE_ERROR_MARKER: &[u8] = b"AttributeError";

/// Separator between resource names in a `ListInstruments` reply.
pub const LIST_DELIMITER: &[u8] = b"%|%";

/// Failure kind for stale or out-of-range handles.
pub const KIND_UNKNOWN_HANDLE: &str = "UnknownHandle";

/// Failure kind for attributes outside the allow-list.
pub const KIND_ATTRIBUTE_ERROR: &str = "AttributeError";

/// Failure kind when a connection has no handle values left.
pub const KIND_HANDLES_EXHAUSTED: &str = "HandlesExhausted";

/// One reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Opcode-specific payload.
    Success(Bytes),
    /// Server-side failure.
    Failure { kind: String, message: String },
}

impl Response {
    /// Success carrying the literal acknowledgement.
    pub fn ack() -> Self {
        Response::Success(Bytes::from_static(ACK))
    }

    /// Success carrying a new handle.
    pub fn handle(handle: InstrumentHandle) -> Self {
        Response::Success(Bytes::from(handle.to_wire()))
    }

    /// Success carrying a list of resource names.
    pub fn names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut buf = BytesMut::new();
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                buf.put_slice(LIST_DELIMITER);
            }
            buf.put_slice(name.as_ref().as_bytes());
        }
        Response::Success(buf.freeze())
    }

    /// Failure with the given kind and message.
    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Failure {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Check if this is a failure.
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Response::Failure { .. })
    }

    /// Encode to the wire form.
    ///
    /// A `:` inside the kind would be ambiguous with the separator and is
    /// replaced by `_`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Success(payload) => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(SUCCESS_TAG);
                buf.extend_from_slice(payload);
                buf
            }
            Response::Failure { kind, message } => {
                let kind = kind.replace(':', "_");
                let mut buf = Vec::with_capacity(3 + kind.len() + message.len());
                buf.extend_from_slice(FAILURE_SENTINEL);
                buf.extend_from_slice(kind.as_bytes());
                buf.push(b':');
                buf.extend_from_slice(message.as_bytes());
                buf
            }
        }
    }

    /// Decode from the wire form.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        if payload.first() == Some(&SUCCESS_TAG) {
            return Ok(Response::Success(payload.slice(1..)));
        }

        if let Some(body) = payload.strip_prefix(&FAILURE_SENTINEL[..]) {
            let sep = body.iter().position(|&b| b == b':').ok_or_else(|| {
                Error::Malformed("Failure response without kind separator".to_string())
            })?;
            return Ok(Response::Failure {
                kind: String::from_utf8_lossy(&body[..sep]).into_owned(),
                message: String::from_utf8_lossy(&body[sep + 1..]).into_owned(),
            });
        }

        Err(Error::Malformed(format!(
            "Response has no type tag (first byte {:?})",
            payload.first()
        )))
    }
}

/// Parse a `ListInstruments` payload. An empty payload is an empty list.
pub fn decode_names(payload: &[u8]) -> Result<Vec<String>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    let mut rest = payload;
    loop {
        match find(rest, LIST_DELIMITER) {
            Some(pos) => {
                names.push(utf8_name(&rest[..pos])?);
                rest = &rest[pos + LIST_DELIMITER.len()..];
            }
            None => {
                names.push(utf8_name(rest)?);
                return Ok(names);
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn utf8_name(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Malformed("Resource name is not valid UTF-8".to_string()))
}
