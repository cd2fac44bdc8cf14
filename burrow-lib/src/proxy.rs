//! Local proxy splicing intercepted connections onto tunnel streams.

use std::io::ErrorKind;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{self, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::nat::{self, Nat};
use crate::tunnel::{self, Tunnel};

#[derive(Debug, Error)]
pub enum Error {
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
    #[error(transparent)]
    Nat(#[from] nat::Error),
    #[error(transparent)]
    Tunnel(#[from] tunnel::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Proxy {
    nat: Arc<dyn Nat>,
    tunnel: Arc<dyn Tunnel>,
}

impl Proxy {
    pub fn new(nat: Arc<dyn Nat>, tunnel: Arc<dyn Tunnel>) -> Self {
        Proxy { nat, tunnel }
    }

    /// Accept loop. Returns only on a permanent listener failure; transient
    /// accept errors are logged and the loop continues.
    pub async fn run(&self, listener: TcpListener) -> Result<(), Error> {
        match listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, "listening"),
            Err(_) => tracing::info!("listening"),
        }

        loop {
            match listener.accept().await {
                Ok((conn, _)) => {
                    let nat = Arc::clone(&self.nat);
                    let tunnel = Arc::clone(&self.tunnel);
                    tokio::spawn(async move {
                        if let Err(error) = handle(nat, tunnel, conn).await {
                            tracing::warn!(%error, "failed to handle connection");
                        }
                    });
                }
                Err(error) if is_temporary(&error) => {
                    tracing::warn!(%error, "failed to accept connection");
                }
                Err(error) => return Err(Error::Accept(error)),
            }
        }
    }
}

fn is_temporary(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

async fn handle(
    nat: Arc<dyn Nat>,
    tunnel: Arc<dyn Tunnel>,
    conn: TcpStream,
) -> Result<(), Error> {
    let peer = conn.peer_addr()?;
    let (destination, conn) = nat.get_nat_destination(conn).await?;
    tracing::debug!(src = %peer, dst = %destination, "starting proxy session");

    let stream = tunnel
        .create_stream(&destination.ip().to_string(), destination.port())
        .await?;
    let mut remote_read = stream.reader;
    let mut remote_write = stream.writer;
    let (mut local_read, mut local_write) = conn.into_split();

    // either direction finishing ends the session; the sibling copy is
    // dropped mid-flight so neither side can block on a dead peer
    tokio::select! {
        result = io::copy(&mut local_read, &mut remote_write) => {
            log_copy("local->remote", result);
        }
        result = io::copy(&mut remote_read, &mut local_write) => {
            log_copy("remote->local", result);
        }
    }

    let _ = remote_write.shutdown().await;
    let _ = local_write.shutdown().await;
    tracing::debug!(src = %peer, dst = %destination, "proxy session finished");
    Ok(())
}

fn log_copy(direction: &str, result: std::io::Result<u64>) {
    match result {
        Ok(bytes) => tracing::debug!(direction, bytes, "stream closed"),
        Err(error) => tracing::debug!(direction, %error, "stream failed"),
    }
}
