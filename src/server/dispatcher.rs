//! Per-connection command loop.
//!
//! Reads a frame, decodes it to a [`Command`], executes it against the
//! connection's [`InstrumentRegistry`] and writes exactly one response.
//! Instrument failures are answered with a failure response; protocol
//! errors end the connection.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use super::registry::{InstrumentRegistry, RegistryError};
use crate::codec::JsonCodec;
use crate::driver::{Attribute, DriverError, InstrumentDriver, OpenOptions};
use crate::error::Result;
use crate::protocol::{
    render_payload, Command, InstrumentHandle, Response, ATTRIBUTE_ERROR_MARKER,
    KIND_ATTRIBUTE_ERROR, KIND_HANDLES_EXHAUSTED, KIND_UNKNOWN_HANDLE,
};
use crate::transport::FramedConnection;

impl From<RegistryError> for Response {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownHandle(handle) => Response::failure(
                KIND_UNKNOWN_HANDLE,
                format!("No open instrument with handle {}", handle),
            ),
            RegistryError::HandlesExhausted => Response::failure(
                KIND_HANDLES_EXHAUSTED,
                RegistryError::HandlesExhausted.to_string(),
            ),
            RegistryError::Driver(err) => err.into(),
        }
    }
}

impl From<DriverError> for Response {
    fn from(err: DriverError) -> Self {
        Response::failure(err.kind, err.message)
    }
}

/// Executes commands for one connection.
pub struct Dispatcher {
    driver: Arc<dyn InstrumentDriver>,
    registry: InstrumentRegistry,
}

impl Dispatcher {
    /// Create a dispatcher with an empty registry.
    pub fn new(driver: Arc<dyn InstrumentDriver>) -> Self {
        Self {
            driver,
            registry: InstrumentRegistry::new(),
        }
    }

    /// The connection's registry.
    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    /// Execute one command.
    ///
    /// Instrument and handle failures come back as `Response::Failure`.
    ///
    /// # Errors
    ///
    /// Returns error only for undecodable JSON in the command, which is a
    /// protocol error.
    pub async fn execute(&mut self, command: Command) -> Result<Response> {
        let response = match command {
            Command::OpenInstrument { options } => {
                let options: OpenOptions = JsonCodec::decode(&options)?;
                tracing::debug!("Opening instrument at {}", options.visa_address);
                match self.registry.open(self.driver.as_ref(), &options).await {
                    Ok(handle) => Response::handle(handle),
                    Err(e) => e.into(),
                }
            }
            Command::ListInstruments => match self.driver.list_resource_names().await {
                Ok(names) => Response::names(&names),
                Err(e) => e.into(),
            },
            Command::Ask { handle, message } => {
                tracing::debug!("Ask [{}]: {}", handle, render_payload(&message));
                match self.ask(handle, &message).await {
                    Ok(reply) => Response::Success(reply),
                    Err(e) => e.into(),
                }
            }
            Command::WriteRaw { handle, data } => {
                tracing::debug!("Write [{}]: {}", handle, render_payload(&data));
                match self.write_raw(handle, &data).await {
                    Ok(()) => Response::ack(),
                    Err(e) => e.into(),
                }
            }
            Command::ReadRaw { handle } => match self.read_raw(handle).await {
                Ok(data) => Response::Success(data),
                Err(e) => e.into(),
            },
            Command::Close { handle } => match self.registry.close(handle).await {
                Ok(()) => Response::ack(),
                Err(e) => e.into(),
            },
            Command::Clear { handle } => match self.clear(handle).await {
                Ok(()) => Response::ack(),
                Err(e) => e.into(),
            },
            Command::GetAttr { handle, name } => match self.get_attr(handle, &name).await {
                Ok(Some(value)) => Response::Success(Bytes::from(JsonCodec::encode(&value)?)),
                Ok(None) => Response::Success(Bytes::from_static(ATTRIBUTE_ERROR_MARKER)),
                Err(e) => e.into(),
            },
            Command::SetAttr {
                handle,
                name,
                value,
            } => {
                let value: Value = JsonCodec::decode(&value)?;
                match Attribute::from_name(&name) {
                    Some(attribute) => match self.set_attr(handle, attribute, value).await {
                        Ok(()) => Response::ack(),
                        Err(e) => e.into(),
                    },
                    None => Response::failure(
                        KIND_ATTRIBUTE_ERROR,
                        format!("'{}' is not a settable attribute", name),
                    ),
                }
            }
        };
        Ok(response)
    }

    async fn ask(
        &mut self,
        handle: InstrumentHandle,
        message: &[u8],
    ) -> std::result::Result<Bytes, RegistryError> {
        Ok(self.registry.get(handle)?.ask(message).await?)
    }

    async fn write_raw(
        &mut self,
        handle: InstrumentHandle,
        data: &[u8],
    ) -> std::result::Result<(), RegistryError> {
        Ok(self.registry.get(handle)?.write_raw(data).await?)
    }

    async fn read_raw(
        &mut self,
        handle: InstrumentHandle,
    ) -> std::result::Result<Bytes, RegistryError> {
        Ok(self.registry.get(handle)?.read_raw().await?)
    }

    async fn clear(
        &mut self,
        handle: InstrumentHandle,
    ) -> std::result::Result<(), RegistryError> {
        Ok(self.registry.get(handle)?.clear().await?)
    }

    /// `None` when the name is not an allowed attribute or the instrument
    /// lacks it.
    async fn get_attr(
        &mut self,
        handle: InstrumentHandle,
        name: &str,
    ) -> std::result::Result<Option<Value>, RegistryError> {
        let session = self.registry.get(handle)?;
        match Attribute::from_name(name) {
            Some(attribute) => Ok(session.get_attribute(attribute).await?),
            None => Ok(None),
        }
    }

    async fn set_attr(
        &mut self,
        handle: InstrumentHandle,
        attribute: Attribute,
        value: Value,
    ) -> std::result::Result<(), RegistryError> {
        Ok(self
            .registry
            .get(handle)?
            .set_attribute(attribute, value)
            .await?)
    }

    /// Close every instrument this connection left open.
    pub async fn close(mut self) {
        self.registry.close_all().await;
    }
}

/// Serve one connection until the peer disconnects or sends something
/// undecodable. Instruments left open are closed before returning.
pub async fn serve_connection<S>(
    stream: S,
    driver: Arc<dyn InstrumentDriver>,
    max_frame_size: u32,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = FramedConnection::with_max_frame_size(stream, max_frame_size);
    let mut dispatcher = Dispatcher::new(driver);

    let result = command_loop(&mut conn, &mut dispatcher).await;
    dispatcher.close().await;
    result
}

async fn command_loop<S>(
    conn: &mut FramedConnection<S>,
    dispatcher: &mut Dispatcher,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = conn.receive_or_eof().await? {
        let command = Command::decode(&frame)?;
        tracing::debug!("Received {:?} command", command.opcode());

        let response = dispatcher.execute(command).await?;
        if let Response::Failure { kind, message } = &response {
            tracing::debug!("Command failed: {}: {}", kind, message);
        }
        conn.send(&response.encode()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{SimulatedDriver, SimulatedInstrument};
    use crate::error::Error;
    use crate::protocol::ACK;
    use serde_json::json;
    use tokio::io::duplex;

    const ADDR: &str = "TCPIP::1.2.3.4::INSTR";

    fn driver() -> SimulatedDriver {
        SimulatedDriver::new().with_resource(
            ADDR,
            SimulatedInstrument::new()
                .reply("*IDN?", "FakeInstrument,Model1")
                .fail("*TRG", DriverError::io("trigger timed out")),
        )
    }

    fn open_command() -> Command {
        Command::open(&OpenOptions::new(ADDR)).unwrap()
    }

    fn success(payload: &[u8]) -> Response {
        Response::Success(Bytes::copy_from_slice(payload))
    }

    #[test]
    fn test_registry_errors_become_failures() {
        assert_eq!(
            Response::from(RegistryError::HandlesExhausted),
            Response::failure(
                KIND_HANDLES_EXHAUSTED,
                "Instrument handles exhausted on this connection"
            )
        );
        assert!(matches!(
            Response::from(RegistryError::UnknownHandle(InstrumentHandle(4))),
            Response::Failure { ref kind, .. } if kind == KIND_UNKNOWN_HANDLE
        ));
    }

    #[tokio::test]
    async fn test_open_ask_close() {
        let mut dispatcher = Dispatcher::new(Arc::new(driver()));
        let h = InstrumentHandle(0);

        assert_eq!(dispatcher.execute(open_command()).await.unwrap(), success(b"0"));
        assert_eq!(
            dispatcher
                .execute(Command::Ask {
                    handle: h,
                    message: Bytes::from_static(b"*IDN?"),
                })
                .await
                .unwrap(),
            success(b"FakeInstrument,Model1")
        );
        assert_eq!(
            dispatcher.execute(Command::Close { handle: h }).await.unwrap(),
            success(ACK)
        );

        let response = dispatcher
            .execute(Command::ReadRaw { handle: h })
            .await
            .unwrap();
        assert!(matches!(
            response,
            Response::Failure { ref kind, .. } if kind == KIND_UNKNOWN_HANDLE
        ));
    }

    #[tokio::test]
    async fn test_driver_failure_is_response() {
        let mut dispatcher = Dispatcher::new(Arc::new(driver()));
        dispatcher.execute(open_command()).await.unwrap();

        let response = dispatcher
            .execute(Command::WriteRaw {
                handle: InstrumentHandle(0),
                data: Bytes::from_static(b"*TRG"),
            })
            .await
            .unwrap();
        assert_eq!(response, Response::failure("VisaIOError", "trigger timed out"));
    }

    #[tokio::test]
    async fn test_open_unknown_address_is_failure() {
        let mut dispatcher = Dispatcher::new(Arc::new(driver()));
        let response = dispatcher
            .execute(Command::open(&OpenOptions::new("GPIB0::1::INSTR")).unwrap())
            .await
            .unwrap();
        assert!(response.is_failure());
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_open_invalid_json_is_protocol_error() {
        let mut dispatcher = Dispatcher::new(Arc::new(driver()));
        let result = dispatcher
            .execute(Command::OpenInstrument {
                options: Bytes::from_static(b"{not json"),
            })
            .await;
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn test_attributes() {
        let mut dispatcher = Dispatcher::new(Arc::new(driver()));
        dispatcher.execute(open_command()).await.unwrap();
        let h = InstrumentHandle(0);

        let set = Command::set_attr(h, "timeout", &5000).unwrap();
        assert_eq!(dispatcher.execute(set).await.unwrap(), success(ACK));

        let get = |name: &str| Command::GetAttr {
            handle: h,
            name: name.to_string(),
        };
        assert_eq!(dispatcher.execute(get("timeout")).await.unwrap(), success(b"5000"));

        // Allowed but unset, and not allowed at all
        assert_eq!(
            dispatcher.execute(get("lock")).await.unwrap(),
            success(ATTRIBUTE_ERROR_MARKER)
        );
        assert_eq!(
            dispatcher.execute(get("__dict__")).await.unwrap(),
            success(ATTRIBUTE_ERROR_MARKER)
        );

        let set = Command::set_attr(h, "resource_name", &json!("x")).unwrap();
        let response = dispatcher.execute(set).await.unwrap();
        assert!(matches!(
            response,
            Response::Failure { ref kind, .. } if kind == KIND_ATTRIBUTE_ERROR
        ));
    }

    #[tokio::test]
    async fn test_getattr_unknown_handle() {
        let mut dispatcher = Dispatcher::new(Arc::new(driver()));
        let response = dispatcher
            .execute(Command::GetAttr {
                handle: InstrumentHandle(3),
                name: "timeout".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            response,
            Response::Failure { ref kind, .. } if kind == KIND_UNKNOWN_HANDLE
        ));
    }

    #[tokio::test]
    async fn test_list_instruments() {
        let mut dispatcher = Dispatcher::new(Arc::new(driver()));
        assert_eq!(
            dispatcher.execute(Command::ListInstruments).await.unwrap(),
            success(ADDR.as_bytes())
        );

        let mut empty = Dispatcher::new(Arc::new(SimulatedDriver::new()));
        assert_eq!(
            empty.execute(Command::ListInstruments).await.unwrap(),
            success(b"")
        );
    }

    #[tokio::test]
    async fn test_serve_connection_closes_instruments_on_eof() {
        let driver = driver();
        let (client, server) = duplex(4096);
        let task = tokio::spawn(serve_connection(
            server,
            Arc::new(driver.clone()),
            crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE,
        ));

        let mut conn = FramedConnection::new(client);
        conn.send(&open_command().encode().unwrap()).await.unwrap();
        let reply = Response::decode(&conn.receive().await.unwrap()).unwrap();
        assert_eq!(reply, success(b"0"));
        assert_eq!(driver.open_sessions(), 1);

        drop(conn);
        task.await.unwrap().unwrap();
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_serve_connection_ends_on_unknown_opcode() {
        let driver = driver();
        let (client, server) = duplex(4096);
        let task = tokio::spawn(serve_connection(
            server,
            Arc::new(driver.clone()),
            crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE,
        ));

        let mut conn = FramedConnection::new(client);
        conn.send(&open_command().encode().unwrap()).await.unwrap();
        conn.receive().await.unwrap();

        conn.send(b"X:1").await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(Error::Malformed(_))));
        assert!(matches!(conn.receive().await, Err(Error::ConnectionClosed)));
        assert_eq!(driver.open_sessions(), 0);
    }
}
