//! Kernel NAT redirection.
//!
//! Two back-ends share one capability set: an iptables chain on Linux and a
//! pf anchor on macOS. Each live process owns exactly one chain/anchor whose
//! name embeds its pid, which both keeps concurrent runs apart and lets a
//! later run reclaim rules leaked by a crashed one.

pub mod iptables;
pub mod pf;

#[cfg(test)]
pub(crate) mod mocks;

use std::collections::BTreeSet;
use std::net::SocketAddrV4;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::privsep::PrivOps;

/// Product identifier embedded in chain and anchor names.
pub const PRODUCT: &str = "burrow";

#[derive(Debug, Error)]
pub enum Error {
    #[error("nat state is not found")]
    StateNotFound,
    #[error("{command} exited with status {status}: {stderr}")]
    RuleMutation {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error(transparent)]
    Priv(#[from] crate::privsep::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is not supported")]
    UnsupportedPlatform(String),
}

#[async_trait]
pub trait Nat: Send + Sync {
    /// Remove chains/anchors owned by processes that no longer exist.
    /// Safe to run before [`setup`](Nat::setup) and idempotent.
    async fn cleanup(&self) -> Result<(), Error>;

    /// Install the process-owned chain/anchor and the jump rules routing
    /// candidate packets into it.
    async fn setup(&self) -> Result<(), Error>;

    /// Make the owned rule set redirect TCP traffic for exactly the given
    /// subnets to the local proxy port.
    async fn redirect_subnets(&self, subnets: &[String]) -> Result<(), Error>;

    /// Recover the pre-NAT destination of an intercepted connection. The
    /// returned stream is the handle callers must use from here on.
    async fn get_nat_destination(
        &self,
        conn: TcpStream,
    ) -> Result<(SocketAddrV4, TcpStream), Error>;

    /// Remove the jump rules and the owned chain/anchor.
    async fn shutdown(&self) -> Result<(), Error>;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Construct the back-end for the current platform.
        pub fn new(priv_ops: Arc<dyn PrivOps>, proxy_port: u16) -> Result<Arc<dyn Nat>, Error> {
            Ok(Arc::new(iptables::Iptables::new(priv_ops, proxy_port)))
        }
    } else if #[cfg(target_os = "macos")] {
        /// Construct the back-end for the current platform.
        pub fn new(priv_ops: Arc<dyn PrivOps>, proxy_port: u16) -> Result<Arc<dyn Nat>, Error> {
            Ok(Arc::new(pf::Pf::new(priv_ops, proxy_port)))
        }
    } else {
        /// Construct the back-end for the current platform.
        pub fn new(_priv_ops: Arc<dyn PrivOps>, _proxy_port: u16) -> Result<Arc<dyn Nat>, Error> {
            Err(Error::UnsupportedPlatform(std::env::consts::OS.to_string()))
        }
    }
}

/// Pids of dead former owners found in kernel rule listings. `separator`
/// is the character between the product name and the `pid` suffix (`-` for
/// chains, `/` for anchors).
pub(crate) fn zombie_pids(
    listing: &str,
    separator: char,
    self_pid: u32,
    alive: impl Fn(u32) -> bool,
) -> Vec<u32> {
    let pattern = format!(r"{PRODUCT}{separator}pid(\d+)");
    let re = Regex::new(&pattern).expect("hardcoded pattern");

    let mut pids = BTreeSet::new();
    for capture in re.captures_iter(listing) {
        if let Ok(pid) = capture[1].parse::<u32>() {
            pids.insert(pid);
        }
    }
    pids.into_iter()
        .filter(|&pid| pid != self_pid && !alive(pid))
        .collect()
}
