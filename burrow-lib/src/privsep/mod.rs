//! Privileged helper channel.
//!
//! Firewall mutation needs root, the rest of the process does not. The
//! unprivileged process spawns a second instance of its own executable in
//! `priv` mode (through sudo when not already root) and drives it over a
//! pair of pipes with a line-framed JSON protocol.

pub mod client;
pub mod proto;
pub mod server;

use async_trait::async_trait;
use thiserror::Error;

pub use client::Client;
pub use proto::{CommandOutput, CommandRequest};
pub use server::Server;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed serializing helper message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("helper protocol violation: {0}")]
    Protocol(String),
    #[error("helper channel closed")]
    ChannelClosed,
    #[error("{0}")]
    Helper(String),
}

/// The capability the NAT back-ends consume. Production implementation is
/// [`Client`]; tests substitute recording doubles.
#[async_trait]
pub trait PrivOps: Send + Sync {
    /// Run a whitelisted command in the elevated process. A nonzero exit
    /// code is reported in the output, not as an error.
    async fn command(&self, request: CommandRequest) -> Result<CommandOutput, Error>;

    /// Atomically replace /etc/pf.conf with the given content.
    async fn write_pf_conf(&self, content: &str) -> Result<(), Error>;
}
