//! Wire format encoding and decoding.
//!
//! Every frame is a 4-byte length header followed by the payload:
//! ```text
//! ┌──────────┬─────────────────┐
//! │ Length   │ Payload         │
//! │ 4 bytes  │ Length bytes    │
//! │ uint32 BE│                 │
//! └──────────┴─────────────────┘
//! ```

use crate::error::{Error, Result};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Absolute maximum payload size (what the header can express).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = u32::MAX;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(payload_length: u32) -> Self {
        Self { payload_length }
    }

    /// Header for a payload, failing if it cannot be expressed in 32 bits.
    pub fn for_payload(payload: &[u8]) -> Result<Self> {
        let payload_length = u32::try_from(payload.len()).map_err(|_| {
            Error::Malformed(format!(
                "Payload size {} exceeds maximum {}",
                payload.len(),
                ABSOLUTE_MAX_PAYLOAD_SIZE
            ))
        })?;
        Ok(Self { payload_length })
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use instrument_relay::protocol::Header;
    ///
    /// let bytes = Header::new(5).encode();
    /// assert_eq!(bytes, [0, 0, 0, 5]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        self.payload_length.to_be_bytes()
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            payload_length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        })
    }

    /// Check the declared payload length against a maximum.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(Error::Malformed(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }
        Ok(())
    }
}

/// Build a complete frame as a single byte vector.
pub fn build_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let header = Header::for_payload(payload)?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf)
}
