//! TCP connection establishment.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Connect to `address`, giving up after `timeout`.
///
/// Both a timeout and a refused/unresolvable address surface as
/// `ServerUnreachable` naming the configured address.
pub async fn connect_with_timeout(address: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!("Connect to {} failed: {}", address, e);
            return Err(Error::ServerUnreachable {
                address: address.to_string(),
            });
        }
        Err(_) => {
            tracing::debug!("Connect to {} timed out after {:?}", address, timeout);
            return Err(Error::ServerUnreachable {
                address: address.to_string(),
            });
        }
    };

    // Commands are small request/response exchanges
    stream.set_nodelay(true)?;
    Ok(stream)
}
