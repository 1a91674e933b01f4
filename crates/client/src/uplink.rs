use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use quinn::{Connection, Endpoint, VarInt};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("not connected to the collector")]
    NotConnected,
    #[error("failed to open stream: {0}")]
    Open(#[from] quinn::ConnectionError),
    #[error("failed to write stream: {0}")]
    Write(#[from] quinn::WriteError),
    #[error("failed to finish stream: {0}")]
    Finish(#[from] quinn::ClosedStream),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The secure channel a telemetry client reports over.
#[async_trait]
pub trait Uplink: Send + Sync + 'static {
    /// Establishes and validates a fresh connection, replacing any previous one.
    async fn connect(&self) -> Result<()>;

    /// Delivers one payload on its own stream.
    async fn send(&self, payload: Vec<u8>) -> Result<(), SendError>;

    async fn disconnect(&self);
}

/// QUIC connection to the collector, one unidirectional stream per message.
pub struct QuicUplink {
    endpoint: Endpoint,
    server_addr: String,
    server_name: String,
    connection: Mutex<Option<Connection>>,
}

impl QuicUplink {
    pub fn new(server_addr: &str, server_name: &str) -> Result<Self> {
        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .context("Failed to bind client endpoint")?;
        endpoint.set_default_client_config(shared::tls::client_config()?);

        Ok(Self {
            endpoint,
            server_addr: server_addr.to_string(),
            server_name: server_name.to_string(),
            connection: Mutex::new(None),
        })
    }

    fn current(&self) -> Option<Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace(&self, connection: Option<Connection>) -> Option<Connection> {
        let mut slot = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, connection)
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host(&self.server_addr)
            .await
            .map_err(|err| anyhow!("Failed to resolve collector address '{}': {:?}", self.server_addr, err))
            .and_then(|mut addrs| {
                addrs
                    .find(SocketAddr::is_ipv4)
                    .ok_or_else(|| anyhow!("No IPv4 address found for collector address '{}'", self.server_addr))
            })
    }
}

#[async_trait]
impl Uplink for QuicUplink {
    async fn connect(&self) -> Result<()> {
        let addr = self.resolve().await?;
        debug!("Connecting to collector at '{}'", addr);

        let connection = self
            .endpoint
            .connect(addr, &self.server_name)
            .context("Failed to start connection")?
            .await
            .with_context(|| format!("Failed to connect to '{}'", addr))?;

        // An empty stream proves the channel carries streams before we report success.
        let mut probe = connection.open_uni().await.context("Failed to open probe stream")?;
        probe.finish().context("Failed to close probe stream")?;

        info!(
            event = "connected",
            server_addr = addr.to_string(),
            "Connected to collector '{}'", addr
        );
        if let Some(previous) = self.replace(Some(connection)) {
            previous.close(VarInt::from_u32(0), b"client reconnect");
        }
        Ok(())
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), SendError> {
        let connection = self.current().ok_or(SendError::NotConnected)?;
        let mut stream = connection.open_uni().await?;
        stream.write_all(&payload).await?;
        stream.finish()?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(connection) = self.replace(None) {
            connection.close(VarInt::from_u32(0), b"client disconnect");
            info!(event = "disconnect", "Disconnected from collector");
        }
    }
}
