//! Driver module - the capability the server uses to reach real instruments.
//!
//! Provides:
//! - [`InstrumentDriver`] - opens sessions and lists resources (shared by all connections)
//! - [`InstrumentSession`] - one open instrument (owned by one connection's registry)
//! - [`Attribute`] - the fixed set of attributes a session exposes
//! - [`SimulatedDriver`] - scripted in-process driver for tests and demos
//!
//! Methods return boxed futures so both traits stay object-safe.

mod simulated;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use simulated::{SimulatedDriver, SimulatedInstrument};

/// Boxed future for driver results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Failure reported by a driver as a (kind, message) pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    /// Error kind name, e.g. `VisaIOError`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A `VisaIOError` with the given message.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new("VisaIOError", message)
    }
}

/// Attributes an instrument session exposes.
///
/// Names outside this set are rejected before reaching a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    Timeout,
    ChunkSize,
    ValuesFormat,
    TermChars,
    SendEnd,
    Delay,
    Lock,
}

impl Attribute {
    /// Every attribute, in wire-name order of the allow-list.
    pub const ALL: [Attribute; 7] = [
        Attribute::Timeout,
        Attribute::ChunkSize,
        Attribute::ValuesFormat,
        Attribute::TermChars,
        Attribute::SendEnd,
        Attribute::Delay,
        Attribute::Lock,
    ];

    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            Attribute::Timeout => "timeout",
            Attribute::ChunkSize => "chunk_size",
            Attribute::ValuesFormat => "values_format",
            Attribute::TermChars => "term_chars",
            Attribute::SendEnd => "send_end",
            Attribute::Delay => "delay",
            Attribute::Lock => "lock",
        }
    }

    /// Look up an attribute by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options sent with `OpenInstrument`: the resource address plus any
/// driver-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// VISA resource address, e.g. `TCPIP::1.2.3.4::INSTR`.
    pub visa_address: String,
    /// Driver-specific options.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OpenOptions {
    /// Options with only an address.
    pub fn new(visa_address: impl Into<String>) -> Self {
        Self {
            visa_address: visa_address.into(),
            extra: Map::new(),
        }
    }

    /// Add a driver-specific option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One open instrument.
pub trait InstrumentSession: Send {
    /// Write `message` and read the reply.
    fn ask<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, DriverResult<Bytes>>;

    /// Write raw bytes.
    fn write_raw<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, DriverResult<()>>;

    /// Read raw bytes.
    fn read_raw(&mut self) -> BoxFuture<'_, DriverResult<Bytes>>;

    /// Close the session.
    fn close(&mut self) -> BoxFuture<'_, DriverResult<()>>;

    /// Clear the device.
    fn clear(&mut self) -> BoxFuture<'_, DriverResult<()>>;

    /// Read an attribute. `None` when the instrument does not have it.
    fn get_attribute(&mut self, attribute: Attribute) -> BoxFuture<'_, DriverResult<Option<Value>>>;

    /// Write an attribute.
    fn set_attribute(
        &mut self,
        attribute: Attribute,
        value: Value,
    ) -> BoxFuture<'_, DriverResult<()>>;
}

/// Process-wide instrument driver.
///
/// Shared by every connection; any locking a physical device needs is the
/// driver's responsibility.
pub trait InstrumentDriver: Send + Sync + 'static {
    /// Open a session for `options.visa_address`.
    fn open<'a>(
        &'a self,
        options: &'a OpenOptions,
    ) -> BoxFuture<'a, DriverResult<Box<dyn InstrumentSession>>>;

    /// Resource names of the instruments the driver can see.
    fn list_resource_names(&self) -> BoxFuture<'_, DriverResult<Vec<String>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_names_roundtrip() {
        for attr in Attribute::ALL {
            assert_eq!(Attribute::from_name(attr.name()), Some(attr));
        }
        assert_eq!(Attribute::from_name("__class__"), None);
        assert_eq!(Attribute::from_name("Timeout"), None);
    }

    #[test]
    fn test_open_options_flatten() {
        let options = OpenOptions::new("GPIB0::5::INSTR").option("timeout", 3000);
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(
            value,
            json!({ "visa_address": "GPIB0::5::INSTR", "timeout": 3000 })
        );

        let parsed: OpenOptions = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn test_open_options_require_address() {
        let result: std::result::Result<OpenOptions, _> =
            serde_json::from_value(json!({ "timeout": 1 }));
        assert!(result.is_err());
    }

    #[test]
    fn test_driver_error_display() {
        assert_eq!(
            DriverError::io("resource not found").to_string(),
            "VisaIOError: resource not found"
        );
    }
}
