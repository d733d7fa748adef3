//! In-process simulated driver.
//!
//! Instruments are scripted with query/reply pairs and optional failures.
//! Each `open` gets its own copy of the script, so connections never share
//! session state.
//!
//! # Example
//!
//! ```
//! use instrument_relay::driver::{SimulatedDriver, SimulatedInstrument};
//!
//! let driver = SimulatedDriver::new().with_resource(
//!     "TCPIP::1.2.3.4::INSTR",
//!     SimulatedInstrument::new().reply("*IDN?", "FakeInstrument,Model1"),
//! );
//! assert_eq!(driver.open_sessions(), 0);
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};

use super::{
    Attribute, BoxFuture, DriverError, DriverResult, InstrumentDriver, InstrumentSession,
    OpenOptions,
};

/// Script for one simulated instrument.
#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    replies: HashMap<Vec<u8>, Bytes>,
    failures: HashMap<Vec<u8>, DriverError>,
    attributes: HashMap<Attribute, Value>,
    close_error: Option<DriverError>,
}

impl SimulatedInstrument {
    /// Instrument with typical attribute defaults and no scripted queries.
    ///
    /// `values_format` and `lock` are left unset.
    pub fn new() -> Self {
        let attributes = HashMap::from([
            (Attribute::Timeout, json!(2000)),
            (Attribute::ChunkSize, json!(20480)),
            (Attribute::TermChars, json!("")),
            (Attribute::SendEnd, json!(true)),
            (Attribute::Delay, json!(0.0)),
        ]);
        Self {
            replies: HashMap::new(),
            failures: HashMap::new(),
            attributes,
            close_error: None,
        }
    }

    /// Reply with `reply` whenever `query` is written.
    pub fn reply(mut self, query: impl AsRef<[u8]>, reply: impl Into<Bytes>) -> Self {
        self.replies.insert(query.as_ref().to_vec(), reply.into());
        self
    }

    /// Fail with `error` whenever `query` is written.
    pub fn fail(mut self, query: impl AsRef<[u8]>, error: DriverError) -> Self {
        self.failures.insert(query.as_ref().to_vec(), error);
        self
    }

    /// Set an attribute's initial value.
    pub fn attribute(mut self, attribute: Attribute, value: Value) -> Self {
        self.attributes.insert(attribute, value);
        self
    }

    /// Fail every close attempt with `error`.
    pub fn fail_on_close(mut self, error: DriverError) -> Self {
        self.close_error = Some(error);
        self
    }
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver backed by scripted instruments.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDriver {
    resources: BTreeMap<String, SimulatedInstrument>,
    open_sessions: Arc<AtomicUsize>,
}

impl SimulatedDriver {
    /// Driver with no instruments attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an instrument at `address`.
    pub fn with_resource(
        mut self,
        address: impl Into<String>,
        instrument: SimulatedInstrument,
    ) -> Self {
        self.resources.insert(address.into(), instrument);
        self
    }

    /// Number of sessions opened and not yet closed, across all connections.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }
}

impl InstrumentDriver for SimulatedDriver {
    fn open<'a>(
        &'a self,
        options: &'a OpenOptions,
    ) -> BoxFuture<'a, DriverResult<Box<dyn InstrumentSession>>> {
        Box::pin(async move {
            let script = self.resources.get(&options.visa_address).ok_or_else(|| {
                DriverError::io(format!(
                    "Insufficient location information or the requested device or resource is not present in the system ({})",
                    options.visa_address
                ))
            })?;

            let mut script = script.clone();
            if let Some(timeout) = options.extra.get(Attribute::Timeout.name()) {
                script.attributes.insert(Attribute::Timeout, timeout.clone());
            }

            self.open_sessions.fetch_add(1, Ordering::AcqRel);
            let session: Box<dyn InstrumentSession> = Box::new(SimulatedSession {
                script,
                pending: VecDeque::new(),
                closed: false,
                open_sessions: self.open_sessions.clone(),
            });
            Ok(session)
        })
    }

    fn list_resource_names(&self) -> BoxFuture<'_, DriverResult<Vec<String>>> {
        let names = self.resources.keys().cloned().collect();
        Box::pin(async move { Ok(names) })
    }
}

/// Live session over a copy of an instrument script.
struct SimulatedSession {
    script: SimulatedInstrument,
    /// Replies queued by writes, consumed by reads.
    pending: VecDeque<Bytes>,
    closed: bool,
    open_sessions: Arc<AtomicUsize>,
}

impl SimulatedSession {
    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::io(
                "Invalid session handle. The resource might be closed.",
            ));
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> DriverResult<()> {
        self.ensure_open()?;
        let query = trim_terminator(data);
        if let Some(err) = self.script.failures.get(query) {
            return Err(err.clone());
        }
        if let Some(reply) = self.script.replies.get(query) {
            self.pending.push_back(reply.clone());
        }
        Ok(())
    }

    fn read(&mut self) -> DriverResult<Bytes> {
        self.ensure_open()?;
        self.pending
            .pop_front()
            .ok_or_else(|| DriverError::io("Timeout expired before operation completed."))
    }
}

fn trim_terminator(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|&b| b != b'\n' && b != b'\r')
        .map_or(0, |i| i + 1);
    &data[..end]
}

impl InstrumentSession for SimulatedSession {
    fn ask<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, DriverResult<Bytes>> {
        Box::pin(async move {
            self.write(message)?;
            self.read()
        })
    }

    fn write_raw<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(async move { self.write(data) })
    }

    fn read_raw(&mut self) -> BoxFuture<'_, DriverResult<Bytes>> {
        Box::pin(async move { self.read() })
    }

    fn close(&mut self) -> BoxFuture<'_, DriverResult<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            if let Some(err) = &self.script.close_error {
                return Err(err.clone());
            }
            self.closed = true;
            self.pending.clear();
            self.open_sessions.fetch_sub(1, Ordering::AcqRel);
            Ok(())
        })
    }

    fn clear(&mut self) -> BoxFuture<'_, DriverResult<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.pending.clear();
            Ok(())
        })
    }

    fn get_attribute(
        &mut self,
        attribute: Attribute,
    ) -> BoxFuture<'_, DriverResult<Option<Value>>> {
        Box::pin(async move {
            self.ensure_open()?;
            Ok(self.script.attributes.get(&attribute).cloned())
        })
    }

    fn set_attribute(
        &mut self,
        attribute: Attribute,
        value: Value,
    ) -> BoxFuture<'_, DriverResult<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.script.attributes.insert(attribute, value);
            Ok(())
        })
    }
}
