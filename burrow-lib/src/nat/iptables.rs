//! Linux back-end driving a chain in the kernel nat table.
//!
//! The owned chain starts with a RETURN for local destinations so traffic
//! to the host itself is never intercepted, followed by one REDIRECT rule
//! per active subnet. Jump rules at position 1 of OUTPUT and PREROUTING
//! send both locally-originated and forwarded traffic through the chain.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::privsep::{CommandOutput, CommandRequest, PrivOps};
use crate::process;

use super::{Error, Nat, PRODUCT, zombie_pids};

/// Netfilter socket option returning the pre-NAT destination of a
/// redirected connection.
const SO_ORIGINAL_DST: libc::c_int = 80;

pub struct Iptables {
    priv_ops: Arc<dyn PrivOps>,
    proxy_port: u16,
    installed: Mutex<BTreeSet<String>>,
}

impl Iptables {
    pub fn new(priv_ops: Arc<dyn PrivOps>, proxy_port: u16) -> Self {
        Iptables {
            priv_ops,
            proxy_port,
            installed: Mutex::new(BTreeSet::new()),
        }
    }

    fn chain(&self) -> String {
        chain_for_pid(std::process::id())
    }

    async fn iptables<const N: usize>(&self, args: [&str; N]) -> Result<CommandOutput, Error> {
        let request = CommandRequest {
            command: "iptables".to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            stdin: String::new(),
        };
        let output = self.priv_ops.command(request).await?;
        if output.exit_code != 0 {
            return Err(Error::RuleMutation {
                command: "iptables".to_string(),
                status: output.exit_code,
                stderr: output.stderr.trim_end().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Nat for Iptables {
    async fn cleanup(&self) -> Result<(), Error> {
        let listing = self.iptables(["-t", "nat", "-L", "-n"]).await?;
        let zombies = zombie_pids(&listing.stdout, '-', std::process::id(), process::is_alive);

        for pid in zombies {
            let chain = chain_for_pid(pid);
            tracing::info!(pid, chain = %chain, "deleting zombie iptables chain");

            // a crashed run may have died before installing its jump rules
            for hook in ["OUTPUT", "PREROUTING"] {
                if let Err(error) = self.iptables(["-t", "nat", "-D", hook, "-j", &chain]).await {
                    tracing::debug!(%error, hook, "jump rule already absent");
                }
            }
            self.iptables(["-t", "nat", "-F", &chain]).await?;
            self.iptables(["-t", "nat", "-X", &chain]).await?;
        }
        Ok(())
    }

    async fn setup(&self) -> Result<(), Error> {
        let chain = self.chain();

        self.iptables(["-t", "nat", "-N", &chain]).await?;
        self.iptables(["-t", "nat", "-F", &chain]).await?;
        self.iptables(["-t", "nat", "-I", "OUTPUT", "1", "-j", &chain])
            .await?;
        self.iptables(["-t", "nat", "-I", "PREROUTING", "1", "-j", &chain])
            .await?;
        self.iptables([
            "-t", "nat", "-A", &chain, "-j", "RETURN", "-m", "addrtype", "--dst-type", "LOCAL",
        ])
        .await?;

        Ok(())
    }

    async fn redirect_subnets(&self, subnets: &[String]) -> Result<(), Error> {
        let chain = self.chain();
        let port = self.proxy_port.to_string();
        let mut installed = self.installed.lock().await;

        let target: BTreeSet<String> = subnets.iter().cloned().collect();
        let adds: Vec<String> = target.difference(&installed).cloned().collect();
        let removes: Vec<String> = installed.difference(&target).cloned().collect();

        // the installed set is committed per rule so a failed call picks up
        // where it left off on the next push
        for subnet in adds {
            self.iptables([
                "-t", "nat", "-A", &chain, "-j", "REDIRECT", "--dest", &subnet, "-p", "tcp",
                "--to-ports", &port,
            ])
            .await?;
            installed.insert(subnet);
        }
        for subnet in removes {
            self.iptables([
                "-t", "nat", "-D", &chain, "-j", "REDIRECT", "--dest", &subnet, "-p", "tcp",
                "--to-ports", &port,
            ])
            .await?;
            installed.remove(&subnet);
        }
        Ok(())
    }

    async fn get_nat_destination(
        &self,
        conn: TcpStream,
    ) -> Result<(SocketAddrV4, TcpStream), Error> {
        let fd = conn.as_raw_fd();
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut libc::sockaddr_in as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            let error = std::io::Error::last_os_error();
            return match error.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ENOPROTOOPT) => Err(Error::StateNotFound),
                _ => Err(Error::Io(error)),
            };
        }

        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok((SocketAddrV4::new(ip, port), conn))
    }

    async fn shutdown(&self) -> Result<(), Error> {
        let chain = self.chain();

        self.iptables(["-t", "nat", "-D", "OUTPUT", "-j", &chain])
            .await?;
        self.iptables(["-t", "nat", "-D", "PREROUTING", "-j", &chain])
            .await?;
        self.iptables(["-t", "nat", "-F", &chain]).await?;
        self.iptables(["-t", "nat", "-X", &chain]).await?;

        Ok(())
    }
}

fn chain_for_pid(pid: u32) -> String {
    format!("{PRODUCT}-pid{pid}")
}
