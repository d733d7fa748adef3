//! # instrument-relay
//!
//! Remote control of lab instruments over TCP.
//!
//! A [`Server`] runs next to the instruments and owns the driver. A
//! [`Client`] on another machine opens instruments through it and gets
//! back small integer handles, then issues commands against those handles.
//!
//! ## Architecture
//!
//! - **Framing**: every message is a 4-byte big-endian length plus payload
//! - **Commands**: `<opcode>:<args>`, the final argument binary-safe
//! - **Responses**: `+<payload>` on success, `!!<kind>:<message>` on failure
//! - **Handles**: per connection, sequential from 0, never reused
//!
//! ## Example
//!
//! ```ignore
//! use instrument_relay::driver::{SimulatedDriver, SimulatedInstrument};
//! use instrument_relay::{Client, Server};
//!
//! #[tokio::main]
//! async fn main() -> instrument_relay::Result<()> {
//!     let driver = SimulatedDriver::new().with_resource(
//!         "TCPIP::1.2.3.4::INSTR",
//!         SimulatedInstrument::new().reply("*IDN?", "FakeInstrument,Model1"),
//!     );
//!     let server = Server::builder().bind_address("127.0.0.1:0").bind(driver).await?;
//!     let address = server.local_addr()?.to_string();
//!     tokio::spawn(server.run());
//!
//!     let mut client = Client::new(address);
//!     let handle = client.open("TCPIP::1.2.3.4::INSTR").await?;
//!     let idn = client.ask(handle, "*IDN?").await?;
//!     client.close(handle).await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

mod client;

pub use client::{
    Client, ClientBuilder, ClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SERVER_ADDRESS,
};
pub use error::{Error, RemoteErrorKind, Result};
pub use protocol::InstrumentHandle;
pub use server::{Server, ServerBuilder, ServerConfig, DEFAULT_PORT};
