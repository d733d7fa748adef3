//! Error types for instrument-relay.

use std::fmt;

use thiserror::Error;

/// Main error type for all relay operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the TCP stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (options and attribute values).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer ended the stream before a full frame (or a response) arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame or command could not be decoded.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Could not establish a connection to the server within the timeout.
    #[error("Could not reach instrument server at {address}; check the address and that the server is running")]
    ServerUnreachable {
        /// Configured server address.
        address: String,
    },

    /// Handle is out of range or refers to a closed instrument.
    #[error("Unknown instrument handle: {0}")]
    UnknownHandle(u32),

    /// Attribute is not in the allow-list, or the instrument does not have it.
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    /// Failure reported by the instrument driver on the server.
    #[error("{kind}: {message}")]
    Instrument {
        /// Driver-reported error kind.
        kind: RemoteErrorKind,
        /// Driver-reported message.
        message: String,
    },
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds a driver can report across the wire.
///
/// Unrecognized kinds are kept verbatim in [`RemoteErrorKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// I/O failure talking to the instrument.
    VisaIOError,
    /// Non-fatal condition reported by the instrument library.
    VisaIOWarning,
    /// Any other kind name.
    Other(String),
}

impl RemoteErrorKind {
    /// Map a wire kind name to a kind.
    pub fn from_name(name: &str) -> Self {
        match name {
            "VisaIOError" => Self::VisaIOError,
            "VisaIOWarning" => Self::VisaIOWarning,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire name of this kind.
    pub fn name(&self) -> &str {
        match self {
            Self::VisaIOError => "VisaIOError",
            Self::VisaIOWarning => "VisaIOWarning",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_kinds() {
        assert_eq!(
            RemoteErrorKind::from_name("VisaIOError"),
            RemoteErrorKind::VisaIOError
        );
        assert_eq!(
            RemoteErrorKind::from_name("VisaIOWarning"),
            RemoteErrorKind::VisaIOWarning
        );
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let kind = RemoteErrorKind::from_name("GpibTimeout");
        assert_eq!(kind, RemoteErrorKind::Other("GpibTimeout".to_string()));
        assert_eq!(kind.name(), "GpibTimeout");
    }

    #[test]
    fn test_instrument_error_display() {
        let err = Error::Instrument {
            kind: RemoteErrorKind::VisaIOError,
            message: "timeout expired".to_string(),
        };
        assert_eq!(err.to_string(), "VisaIOError: timeout expired");
    }
}
