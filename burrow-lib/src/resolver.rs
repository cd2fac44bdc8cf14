//! Periodic target resolution feeding the NAT layer.
//!
//! Hostname targets are re-resolved on every tick. A resolved subnet stays
//! installed for [`HOLDOVER`] after it last appeared, so a transient DNS
//! failure or TTL flip does not cut rules out from under in-flight
//! connections. Rules are only pushed when the sorted set actually changed.

use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::nat::{self, Nat};
use crate::subnet;

/// How long a previously resolved subnet stays installed after it stops
/// appearing in lookups.
pub const HOLDOVER: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed resolving {target}: {source}")]
    Resolution {
        target: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Nat(#[from] nat::Error),
}

/// DNS seam; the system implementation keeps only A records.
#[async_trait]
pub trait DnsOps: Send + Sync {
    async fn lookup_ipv4(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>>;
}

pub struct SystemDns;

#[async_trait]
impl DnsOps for SystemDns {
    async fn lookup_ipv4(&self, host: &str) -> std::io::Result<Vec<Ipv4Addr>> {
        let addresses = tokio::net::lookup_host((host, 0u16)).await?;
        Ok(addresses
            .filter_map(|address| match address {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .collect())
    }
}

pub struct Resolver<D> {
    nat: Arc<dyn Nat>,
    dns: D,
    targets: Vec<String>,
    excludes: Vec<Ipv4Cidr>,
    expire: HashMap<String, SystemTime>,
    last_subnets: Vec<String>,
}

impl<D: DnsOps> Resolver<D> {
    pub fn new(
        nat: Arc<dyn Nat>,
        dns: D,
        targets: Vec<String>,
        excludes: Vec<Ipv4Cidr>,
    ) -> Self {
        Resolver {
            nat,
            dns,
            targets,
            excludes,
            expire: HashMap::new(),
            last_subnets: Vec::new(),
        }
    }

    /// Update loop. The first tick fires immediately; the loop exits once
    /// the token is cancelled, which is the caller's stop acknowledgement
    /// when awaited through the task handle.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("resolver loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(error) = self.update(SystemTime::now()).await {
                tracing::warn!(%error, "failed to update redirected subnets");
            }
        }
    }

    async fn update(&mut self, now: SystemTime) -> Result<(), Error> {
        tracing::debug!("updating subnets");

        let mut subnets: BTreeSet<String> = BTreeSet::new();
        for target in &self.targets {
            if subnet::is_ipv4_target(target) {
                subnets.insert(target.clone());
            } else {
                let addresses =
                    self.dns
                        .lookup_ipv4(target)
                        .await
                        .map_err(|source| Error::Resolution {
                            target: target.clone(),
                            source,
                        })?;
                for address in addresses {
                    subnets.insert(format!("{address}/32"));
                }
            }
        }

        let expiry = now + HOLDOVER;
        for subnet in &subnets {
            self.expire.insert(subnet.clone(), expiry);
        }
        self.expire.retain(|subnet, expires_at| {
            if *expires_at > now {
                subnets.insert(subnet.clone());
                true
            } else {
                false
            }
        });

        let subnets: Vec<String> = subnets
            .into_iter()
            .filter(|subnet| !subnet::is_excluded(subnet, &self.excludes))
            .collect();

        if subnets != self.last_subnets {
            self.nat.redirect_subnets(&subnets).await?;
        }
        self.last_subnets = subnets;
        Ok(())
    }
}
