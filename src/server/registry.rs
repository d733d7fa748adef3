//! Per-connection instrument registry.
//!
//! Handles are indexes into an append-only table, assigned sequentially
//! from 0. Closing an instrument leaves a tombstone, so a handle is never
//! reused within a connection. A connection can open at most `u32::MAX + 1`
//! instruments.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = InstrumentRegistry::new();
//! let handle = registry.open(driver.as_ref(), &options).await?;
//! let reply = registry.get(handle)?.ask(b"*IDN?").await?;
//! registry.close(handle).await?;
//! ```

use thiserror::Error;

use crate::driver::{DriverError, InstrumentDriver, InstrumentSession, OpenOptions};
use crate::protocol::InstrumentHandle;

/// Registry lookup or driver failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Handle out of range or already closed.
    #[error("Unknown instrument handle: {0}")]
    UnknownHandle(InstrumentHandle),

    /// Every handle value has been issued on this connection.
    #[error("Instrument handles exhausted on this connection")]
    HandlesExhausted,

    /// The driver reported a failure.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Table slot.
enum Entry {
    Open(Box<dyn InstrumentSession>),
    Closed,
}

/// Instruments opened by one connection.
///
/// Owned by a single connection task, so no locking.
#[derive(Default)]
pub struct InstrumentRegistry {
    entries: Vec<Entry>,
}

impl InstrumentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an instrument through `driver` and register it.
    ///
    /// Nothing is registered if the driver fails. The driver is not called
    /// once handles are exhausted.
    pub async fn open(
        &mut self,
        driver: &dyn InstrumentDriver,
        options: &OpenOptions,
    ) -> Result<InstrumentHandle, RegistryError> {
        handle_at(self.entries.len())?;
        let session = driver.open(options).await?;
        self.insert(session)
    }

    /// Register an already-open session.
    pub fn insert(
        &mut self,
        session: Box<dyn InstrumentSession>,
    ) -> Result<InstrumentHandle, RegistryError> {
        let handle = handle_at(self.entries.len())?;
        self.entries.push(Entry::Open(session));
        Ok(handle)
    }

    /// Get the session behind an open handle.
    pub fn get(
        &mut self,
        handle: InstrumentHandle,
    ) -> Result<&mut dyn InstrumentSession, RegistryError> {
        match self.entries.get_mut(handle.get() as usize) {
            Some(Entry::Open(session)) => Ok(&mut **session),
            _ => Err(RegistryError::UnknownHandle(handle)),
        }
    }

    /// Close the session behind `handle`.
    ///
    /// Closing an already-closed handle succeeds without touching the
    /// driver. If the driver fails to close, the handle stays open.
    pub async fn close(&mut self, handle: InstrumentHandle) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(handle.get() as usize)
            .ok_or(RegistryError::UnknownHandle(handle))?;

        if let Entry::Open(session) = entry {
            session.close().await?;
            *entry = Entry::Closed;
        }
        Ok(())
    }

    /// Close every open session. Failures are logged and the entry is
    /// dropped anyway.
    pub async fn close_all(&mut self) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Entry::Open(session) = entry {
                if let Err(e) = session.close().await {
                    tracing::warn!("Failed to close instrument {} at teardown: {}", index, e);
                }
                *entry = Entry::Closed;
            }
        }
    }

    /// Number of handles issued so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no handle was ever issued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of handles still open.
    pub fn open_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Entry::Open(_)))
            .count()
    }
}

/// Handle for the table slot at `index`.
fn handle_at(index: usize) -> Result<InstrumentHandle, RegistryError> {
    u32::try_from(index)
        .map(InstrumentHandle)
        .map_err(|_| RegistryError::HandlesExhausted)
}
