//! Remote instrument client.
//!
//! The [`Client`] holds one connection to an instrument server. It connects
//! on first use and keeps the connection until [`Client::disconnect`], drop,
//! or a transport failure. Each call sends one command and waits for its
//! response; server-side failures come back as typed [`Error`]s. A call
//! dropped before its response arrives also drops the connection, and the
//! next call reconnects with fresh handles.
//!
//! # Example
//!
//! ```ignore
//! use instrument_relay::Client;
//!
//! let mut client = Client::builder().address("10.0.0.5:28265").build();
//! let scope = client.open("TCPIP::1.2.3.4::INSTR").await?;
//! let idn = client.ask(scope, "*IDN?").await?;
//! client.set_attribute(scope, "timeout", &5000).await?;
//! client.close(scope).await?;
//! ```

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;

use crate::codec::JsonCodec;
use crate::driver::{Attribute, OpenOptions};
use crate::error::{Error, RemoteErrorKind, Result};
use crate::protocol::{
    decode_names, render_payload, Command, InstrumentHandle, Response, ATTRIBUTE_ERROR_MARKER,
    DEFAULT_MAX_PAYLOAD_SIZE, KIND_ATTRIBUTE_ERROR, KIND_UNKNOWN_HANDLE,
};
use crate::transport::{connect_with_timeout, FramedConnection};

/// Default server address.
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:28265";

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server `host:port`.
    pub address: String,
    /// How long to wait for the TCP connection.
    pub connect_timeout: Duration,
    /// Largest accepted response frame.
    pub max_frame_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_SERVER_ADDRESS.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Builder for [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server address.
    ///
    /// Default: `127.0.0.1:28265`
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    /// Set the connect timeout.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the largest accepted response frame.
    ///
    /// Default: 64 MiB
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Get the configuration built so far.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Build the client. No connection is made yet.
    pub fn build(self) -> Client {
        Client::with_config(self.config)
    }
}

/// Connection to an instrument server.
pub struct Client {
    config: ClientConfig,
    conn: Option<FramedConnection<TcpStream>>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Client for `address` with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self::builder().address(address).build()
    }

    /// Client with explicit settings.
    pub fn with_config(config: ClientConfig) -> Self {
        Self { config, conn: None }
    }

    /// Configured server address.
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Check if a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Connect now instead of on first use.
    pub async fn connect(&mut self) -> Result<()> {
        let conn = self.take_connection().await?;
        self.conn = Some(conn);
        Ok(())
    }

    /// Drop the connection. The next call reconnects.
    pub async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.shutdown().await {
                tracing::debug!("Shutdown of {} failed: {}", self.config.address, e);
            }
        }
    }

    /// Open the instrument at `visa_address`.
    pub async fn open(&mut self, visa_address: &str) -> Result<InstrumentHandle> {
        self.open_with(&OpenOptions::new(visa_address)).await
    }

    /// Open an instrument with driver-specific options.
    pub async fn open_with(&mut self, options: &OpenOptions) -> Result<InstrumentHandle> {
        let payload = self.call(Command::open(options)?).await?;
        InstrumentHandle::from_wire(&payload)
    }

    /// Resource names the server's driver can see.
    pub async fn list_instruments(&mut self) -> Result<Vec<String>> {
        let payload = self.call(Command::ListInstruments).await?;
        decode_names(&payload)
    }

    /// Write `message` and return the instrument's reply.
    pub async fn ask(
        &mut self,
        handle: InstrumentHandle,
        message: impl AsRef<[u8]>,
    ) -> Result<Bytes> {
        self.call(Command::Ask {
            handle,
            message: Bytes::copy_from_slice(message.as_ref()),
        })
        .await
    }

    /// Write raw bytes.
    pub async fn write_raw(
        &mut self,
        handle: InstrumentHandle,
        data: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.call(Command::WriteRaw {
            handle,
            data: Bytes::copy_from_slice(data.as_ref()),
        })
        .await?;
        Ok(())
    }

    /// Write a text command.
    pub async fn write(&mut self, handle: InstrumentHandle, message: &str) -> Result<()> {
        self.write_raw(handle, message).await
    }

    /// Read raw bytes.
    pub async fn read_raw(&mut self, handle: InstrumentHandle) -> Result<Bytes> {
        self.call(Command::ReadRaw { handle }).await
    }

    /// Read a text reply. Invalid UTF-8 is replaced.
    pub async fn read(&mut self, handle: InstrumentHandle) -> Result<String> {
        let data = self.read_raw(handle).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Close an instrument. Closing twice is not an error.
    pub async fn close(&mut self, handle: InstrumentHandle) -> Result<()> {
        self.call(Command::Close { handle }).await?;
        Ok(())
    }

    /// Clear an instrument.
    pub async fn clear(&mut self, handle: InstrumentHandle) -> Result<()> {
        self.call(Command::Clear { handle }).await?;
        Ok(())
    }

    /// Read an attribute.
    ///
    /// # Errors
    ///
    /// `UnknownAttribute` if `name` is not an instrument attribute (checked
    /// locally) or the instrument does not have it.
    pub async fn get_attribute(&mut self, handle: InstrumentHandle, name: &str) -> Result<Value> {
        let attribute = allowed_attribute(name)?;
        let payload = self
            .call(Command::GetAttr {
                handle,
                name: attribute.name().to_string(),
            })
            .await?;

        if &payload[..] == ATTRIBUTE_ERROR_MARKER {
            return Err(Error::UnknownAttribute(name.to_string()));
        }
        JsonCodec::decode(&payload)
    }

    /// Write an attribute.
    pub async fn set_attribute<T: Serialize>(
        &mut self,
        handle: InstrumentHandle,
        name: &str,
        value: &T,
    ) -> Result<()> {
        let attribute = allowed_attribute(name)?;
        self.call(Command::set_attr(handle, attribute.name(), value)?)
            .await?;
        Ok(())
    }

    /// Send one command and wait for its response.
    async fn call(&mut self, command: Command) -> Result<Bytes> {
        let request = command.encode()?;
        tracing::debug!(
            "Sending {:?} ({} bytes): {}",
            command.opcode(),
            request.len(),
            render_payload(&request)
        );

        // Not cached while a reply is outstanding; dropping this future drops
        // the connection.
        let mut conn = self.take_connection().await?;
        let frame = match exchange(&mut conn, &request).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Dropping connection to {}: {}", self.config.address, e);
                return Err(e);
            }
        };
        self.conn = Some(conn);

        match Response::decode(&frame)? {
            Response::Success(payload) => Ok(payload),
            Response::Failure { kind, message } => Err(failure_error(&command, kind, message)),
        }
    }

    /// Take the cached connection, connecting first if there is none.
    async fn take_connection(&mut self) -> Result<FramedConnection<TcpStream>> {
        if let Some(conn) = self.conn.take() {
            return Ok(conn);
        }
        let stream =
            connect_with_timeout(&self.config.address, self.config.connect_timeout).await?;
        tracing::debug!("Connected to instrument server at {}", self.config.address);
        Ok(FramedConnection::with_max_frame_size(
            stream,
            self.config.max_frame_size,
        ))
    }
}

async fn exchange(conn: &mut FramedConnection<TcpStream>, request: &[u8]) -> Result<Bytes> {
    conn.send(request).await?;
    conn.receive().await
}

fn allowed_attribute(name: &str) -> Result<Attribute> {
    Attribute::from_name(name).ok_or_else(|| Error::UnknownAttribute(name.to_string()))
}

/// Map a failure response to the error for the command that caused it.
fn failure_error(command: &Command, kind: String, message: String) -> Error {
    match kind.as_str() {
        KIND_UNKNOWN_HANDLE => Error::UnknownHandle(command.handle().map_or(0, |h| h.get())),
        KIND_ATTRIBUTE_ERROR => match command {
            Command::SetAttr { name, .. } | Command::GetAttr { name, .. } => {
                Error::UnknownAttribute(name.clone())
            }
            _ => Error::UnknownAttribute(message),
        },
        _ => Error::Instrument {
            kind: RemoteErrorKind::from_name(&kind),
            message,
        },
    }
}
