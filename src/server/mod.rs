//! Instrument server.
//!
//! Accepts TCP connections and serves each one in its own task with its
//! own [`Dispatcher`] and [`InstrumentRegistry`]. The driver is shared.
//!
//! # Example
//!
//! ```ignore
//! use instrument_relay::driver::SimulatedDriver;
//! use instrument_relay::Server;
//!
//! let server = Server::builder()
//!     .bind_address("127.0.0.1:28265")
//!     .bind(SimulatedDriver::new())
//!     .await?;
//! server.run().await?;
//! ```

mod dispatcher;
mod registry;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::driver::InstrumentDriver;
use crate::error::{Error, Result};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

pub use dispatcher::{serve_connection, Dispatcher};
pub use registry::{InstrumentRegistry, RegistryError};

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 28265;

/// Default listen address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:28265";

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_address: String,
    /// Largest accepted command frame.
    pub max_frame_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            max_frame_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Builder for [`Server`].
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address.
    ///
    /// Default: `0.0.0.0:28265`
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.bind_address = address.into();
        self
    }

    /// Set the largest accepted command frame.
    ///
    /// Default: 64 MiB
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Get the configuration built so far.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener.
    pub async fn bind<D: InstrumentDriver>(self, driver: D) -> Result<Server> {
        Server::bind(self.config, Arc::new(driver)).await
    }
}

/// A bound instrument server.
pub struct Server {
    listener: TcpListener,
    driver: Arc<dyn InstrumentDriver>,
    config: ServerConfig,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind to `config.bind_address`.
    pub async fn bind(config: ServerConfig, driver: Arc<dyn InstrumentDriver>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_address).await?;
        tracing::info!("Instrument server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            driver,
            config,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already being served keep running to completion.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Instrument server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        // e.g. EMFILE; keep accepting
                        Err(e) => tracing::error!("Accept failed: {}", e),
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        tracing::info!("Client connected from {}", peer);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let driver = self.driver.clone();
        let max_frame_size = self.config.max_frame_size;
        tokio::spawn(async move {
            match serve_connection(stream, driver, max_frame_size).await {
                Ok(()) => tracing::info!("Client {} disconnected", peer),
                Err(Error::ConnectionClosed) => {
                    tracing::info!("Client {} disconnected mid-frame", peer)
                }
                Err(e) => tracing::warn!("Closing connection to {}: {}", peer, e),
            }
        });
    }
}
