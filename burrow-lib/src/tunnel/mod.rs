//! Tunnel transport seam.
//!
//! The proxy needs exactly one capability from the transport: open a byte
//! stream to a destination behind the remote relay. Everything else about
//! the session (reconnects, keepalive, authentication) is the transport's
//! business.

pub mod chisel;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open tunnel stream: {0}")]
    Stream(#[from] std::io::Error),
}

/// One stream to a destination behind the relay: an inbound and an outbound
/// byte pipe. Dropping both ends the stream.
pub struct TunnelStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// A session able to open per-destination streams.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn create_stream(&self, host: &str, port: u16) -> Result<TunnelStream, Error>;
}
