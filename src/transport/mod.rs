//! Transport module - framed byte streams and TCP connection setup.
//!
//! [`FramedConnection`] works over any `AsyncRead + AsyncWrite` stream, so
//! tests can run it over `tokio::io::duplex` and production code over TCP.

mod framed;
mod tcp;

pub use framed::FramedConnection;
pub use tcp::connect_with_timeout;
