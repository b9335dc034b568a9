use crate::packet::{CodecError, Packet};
use std::io;
use std::sync::Arc;
use tokio::time::Duration;

/// A connection to one replica. Stream-socket and RDMA implementations share this contract.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, packet: &Packet) -> Result<(), TransportError>;

    /// Reads the next reply and stores it on `packet` via `Packet::set_reply`.
    async fn recv(&self, packet: &mut Packet) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}")]
    Connect { addr: String, source: io::Error },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    Closed,
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("malformed frame")]
    Codec(#[from] CodecError),
    // No buffers or queue pairs left. Not worth retrying on the same session.
    #[error("out of resources: {0}")]
    ResourceExhausted(String),
}

impl TransportError {
    pub fn is_resource_exhausted(&self) -> bool {
        match self {
            TransportError::ResourceExhausted(_) => true,
            _ => false,
        }
    }
}
