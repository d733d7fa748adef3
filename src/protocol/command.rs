//! Request commands and their colon-delimited wire encoding.
//!
//! ```text
//! <opcode>:<arg1>:<arg2>:...
//! ```
//!
//! Only the separators before the last argument are reserved, so the final
//! argument carries arbitrary bytes (instrument payloads, JSON values).

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::codec::JsonCodec;
use crate::error::{Error, Result};

/// Field separator.
pub const SEPARATOR: u8 = b':';

/// Server-assigned index of an opened instrument.
///
/// Unique within one connection, sequential from 0, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrumentHandle(pub u32);

impl InstrumentHandle {
    /// Raw handle number.
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Decimal ASCII form used on the wire.
    pub fn to_wire(self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }

    /// Parse the decimal ASCII wire form.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(Error::Malformed(format!(
                "Invalid instrument handle '{}'",
                String::from_utf8_lossy(bytes)
            )));
        }
        // All ASCII digits, so the only failure left is overflow
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(InstrumentHandle)
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "Instrument handle '{}' out of range",
                    String::from_utf8_lossy(bytes)
                ))
            })
    }
}

impl fmt::Display for InstrumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    OpenInstrument,
    ListInstruments,
    Ask,
    WriteRaw,
    ReadRaw,
    Close,
    Clear,
    GetAttr,
    SetAttr,
}

impl Opcode {
    /// All opcodes.
    pub const ALL: [Opcode; 9] = [
        Opcode::OpenInstrument,
        Opcode::ListInstruments,
        Opcode::Ask,
        Opcode::WriteRaw,
        Opcode::ReadRaw,
        Opcode::Close,
        Opcode::Clear,
        Opcode::GetAttr,
        Opcode::SetAttr,
    ];

    /// Literal tag on the wire.
    pub fn tag(self) -> &'static [u8] {
        match self {
            Opcode::OpenInstrument => b"I",
            Opcode::ListInstruments => b"G",
            Opcode::Ask => b"A",
            Opcode::WriteRaw => b"W",
            Opcode::ReadRaw => b"R",
            Opcode::Close => b"close",
            Opcode::Clear => b"clear",
            Opcode::GetAttr => b"getattr",
            Opcode::SetAttr => b"setattr",
        }
    }

    /// Look up an opcode by its wire tag.
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.tag() == tag)
    }

    /// Number of arguments following the tag.
    pub fn arity(self) -> usize {
        match self {
            Opcode::ListInstruments => 0,
            Opcode::OpenInstrument | Opcode::ReadRaw | Opcode::Close | Opcode::Clear => 1,
            Opcode::Ask | Opcode::WriteRaw | Opcode::GetAttr => 2,
            Opcode::SetAttr => 3,
        }
    }
}

/// A request sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open an instrument. `options` is a JSON object with a `visa_address` field.
    OpenInstrument { options: Bytes },
    /// List resource names known to the server's driver.
    ListInstruments,
    /// Write a query and read the reply.
    Ask {
        handle: InstrumentHandle,
        message: Bytes,
    },
    /// Write raw bytes.
    WriteRaw { handle: InstrumentHandle, data: Bytes },
    /// Read raw bytes.
    ReadRaw { handle: InstrumentHandle },
    /// Close the instrument session.
    Close { handle: InstrumentHandle },
    /// Clear the instrument.
    Clear { handle: InstrumentHandle },
    /// Read an attribute.
    GetAttr {
        handle: InstrumentHandle,
        name: String,
    },
    /// Write an attribute. `value` is JSON text.
    SetAttr {
        handle: InstrumentHandle,
        name: String,
        value: Bytes,
    },
}

impl Command {
    /// Build an `OpenInstrument` command by serializing `options` as JSON.
    pub fn open<T: Serialize>(options: &T) -> Result<Self> {
        Ok(Command::OpenInstrument {
            options: Bytes::from(JsonCodec::encode(options)?),
        })
    }

    /// Build a `SetAttr` command by serializing `value` as JSON.
    pub fn set_attr<T: Serialize>(handle: InstrumentHandle, name: &str, value: &T) -> Result<Self> {
        Ok(Command::SetAttr {
            handle,
            name: name.to_string(),
            value: Bytes::from(JsonCodec::encode(value)?),
        })
    }

    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::OpenInstrument { .. } => Opcode::OpenInstrument,
            Command::ListInstruments => Opcode::ListInstruments,
            Command::Ask { .. } => Opcode::Ask,
            Command::WriteRaw { .. } => Opcode::WriteRaw,
            Command::ReadRaw { .. } => Opcode::ReadRaw,
            Command::Close { .. } => Opcode::Close,
            Command::Clear { .. } => Opcode::Clear,
            Command::GetAttr { .. } => Opcode::GetAttr,
            Command::SetAttr { .. } => Opcode::SetAttr,
        }
    }

    /// Handle this command targets, if any.
    pub fn handle(&self) -> Option<InstrumentHandle> {
        match self {
            Command::OpenInstrument { .. } | Command::ListInstruments => None,
            Command::Ask { handle, .. }
            | Command::WriteRaw { handle, .. }
            | Command::ReadRaw { handle }
            | Command::Close { handle }
            | Command::Clear { handle }
            | Command::GetAttr { handle, .. }
            | Command::SetAttr { handle, .. } => Some(*handle),
        }
    }

    /// Encode to the wire form.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if a non-final argument contains the separator.
    ///
    /// # Example
    ///
    /// ```
    /// use bytes::Bytes;
    /// use instrument_relay::protocol::Command;
    /// use instrument_relay::InstrumentHandle;
    ///
    /// let cmd = Command::Ask {
    ///     handle: InstrumentHandle(0),
    ///     message: Bytes::from_static(b"*IDN?"),
    /// };
    /// assert_eq!(cmd.encode().unwrap(), b"A:0:*IDN?");
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>> {
        let handle_field;
        let args: Vec<&[u8]> = match self {
            Command::OpenInstrument { options } => vec![&options[..]],
            Command::ListInstruments => Vec::new(),
            Command::Ask { handle, message } => {
                handle_field = handle.to_wire();
                vec![&handle_field[..], &message[..]]
            }
            Command::WriteRaw { handle, data } => {
                handle_field = handle.to_wire();
                vec![&handle_field[..], &data[..]]
            }
            Command::ReadRaw { handle } | Command::Close { handle } | Command::Clear { handle } => {
                handle_field = handle.to_wire();
                vec![&handle_field[..]]
            }
            Command::GetAttr { handle, name } => {
                handle_field = handle.to_wire();
                vec![&handle_field[..], name.as_bytes()]
            }
            Command::SetAttr {
                handle,
                name,
                value,
            } => {
                handle_field = handle.to_wire();
                vec![&handle_field[..], name.as_bytes(), &value[..]]
            }
        };

        let tag = self.opcode().tag();
        let args_len: usize = args.iter().map(|a| a.len() + 1).sum();
        let mut buf = Vec::with_capacity(tag.len() + 1 + args_len);
        buf.extend_from_slice(tag);
        buf.push(SEPARATOR);

        let last = args.len().saturating_sub(1);
        for (i, arg) in args.iter().enumerate() {
            if i < last && arg.contains(&SEPARATOR) {
                return Err(Error::Malformed(format!(
                    "Argument {} of {:?} must not contain ':'",
                    i + 1,
                    self.opcode()
                )));
            }
            if i > 0 {
                buf.push(SEPARATOR);
            }
            buf.extend_from_slice(arg);
        }

        Ok(buf)
    }

    /// Decode from the wire form.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for an unknown opcode, a wrong argument count,
    /// a non-decimal handle, or a non-UTF-8 attribute name.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        let sep = payload
            .iter()
            .position(|&b| b == SEPARATOR)
            .ok_or_else(|| Error::Malformed("Missing opcode separator".to_string()))?;

        let opcode = Opcode::from_tag(&payload[..sep]).ok_or_else(|| {
            Error::Malformed(format!(
                "Unknown opcode '{}'",
                String::from_utf8_lossy(&payload[..sep])
            ))
        })?;

        let args = split_args(payload.slice(sep + 1..), opcode.arity());
        if args.len() != opcode.arity() {
            return Err(Error::Malformed(format!(
                "{:?} expects {} argument(s), got {}",
                opcode,
                opcode.arity(),
                args.len()
            )));
        }

        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or_default();

        let command = match opcode {
            Opcode::OpenInstrument => Command::OpenInstrument { options: next() },
            Opcode::ListInstruments => Command::ListInstruments,
            Opcode::Ask => Command::Ask {
                handle: InstrumentHandle::from_wire(&next())?,
                message: next(),
            },
            Opcode::WriteRaw => Command::WriteRaw {
                handle: InstrumentHandle::from_wire(&next())?,
                data: next(),
            },
            Opcode::ReadRaw => Command::ReadRaw {
                handle: InstrumentHandle::from_wire(&next())?,
            },
            Opcode::Close => Command::Close {
                handle: InstrumentHandle::from_wire(&next())?,
            },
            Opcode::Clear => Command::Clear {
                handle: InstrumentHandle::from_wire(&next())?,
            },
            Opcode::GetAttr => Command::GetAttr {
                handle: InstrumentHandle::from_wire(&next())?,
                name: utf8_field(next())?,
            },
            Opcode::SetAttr => Command::SetAttr {
                handle: InstrumentHandle::from_wire(&next())?,
                name: utf8_field(next())?,
                value: next(),
            },
        };

        Ok(command)
    }
}

/// Split `rest` into at most `arity` fields; the last field keeps any separators.
///
/// An empty `rest` with arity 0 yields no fields. Arity 0 with trailing bytes
/// yields one field so the count check rejects it.
fn split_args(rest: Bytes, arity: usize) -> Vec<Bytes> {
    if arity == 0 {
        return if rest.is_empty() { Vec::new() } else { vec![rest] };
    }

    let mut fields = Vec::with_capacity(arity);
    let mut start = 0;
    for (i, &b) in rest.iter().enumerate() {
        if fields.len() + 1 == arity {
            break;
        }
        if b == SEPARATOR {
            fields.push(rest.slice(start..i));
            start = i + 1;
        }
    }
    fields.push(rest.slice(start..));
    fields
}

fn utf8_field(field: Bytes) -> Result<String> {
    String::from_utf8(field.to_vec())
        .map_err(|_| Error::Malformed("Attribute name is not valid UTF-8".to_string()))
}
