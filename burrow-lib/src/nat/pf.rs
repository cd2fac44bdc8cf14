//! macOS back-end driving a pf anchor.
//!
//! A one-time edit of /etc/pf.conf declares `rdr-anchor "burrow/*"` and
//! `anchor "burrow/*"` so per-process anchors load without further config
//! changes. Rules are installed by rewriting the whole anchor; pf takes a
//! full replacement cheaply, so no rule-level diffing is needed.

use std::fmt::Write as _;
use std::net::SocketAddrV4;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::privsep::{CommandOutput, CommandRequest, PrivOps};
use crate::process;

use super::{Error, Nat, PRODUCT, zombie_pids};

const PF_CONF: &str = "/etc/pf.conf";
const PF_CONF_MARKER: &str = " # added by burrow";

pub struct Pf {
    priv_ops: Arc<dyn PrivOps>,
    proxy_port: u16,
    installed: Mutex<Vec<String>>,
}

impl Pf {
    pub fn new(priv_ops: Arc<dyn PrivOps>, proxy_port: u16) -> Self {
        Pf {
            priv_ops,
            proxy_port,
            installed: Mutex::new(Vec::new()),
        }
    }

    async fn pfctl<const N: usize>(
        &self,
        args: [&str; N],
        stdin: &str,
    ) -> Result<CommandOutput, Error> {
        let request = CommandRequest {
            command: "pfctl".to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            stdin: stdin.to_string(),
        };
        let output = self.priv_ops.command(request).await?;
        if output.exit_code != 0 {
            return Err(Error::RuleMutation {
                command: "pfctl".to_string(),
                status: output.exit_code,
                stderr: output.stderr.trim_end().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Nat for Pf {
    async fn cleanup(&self) -> Result<(), Error> {
        let listing = self.pfctl(["-s", "Anchors", "-a", PRODUCT], "").await?;
        let zombies = zombie_pids(&listing.stdout, '/', std::process::id(), process::is_alive);

        for pid in zombies {
            let anchor = anchor_for_pid(pid);
            tracing::info!(pid, anchor = %anchor, "flushing zombie pf anchor");
            self.pfctl(["-F", "all", "-a", &anchor], "").await?;
        }
        Ok(())
    }

    async fn setup(&self) -> Result<(), Error> {
        self.pfctl(["-E"], "").await?;

        let existing = tokio::fs::read_to_string(PF_CONF).await?;
        let content = declare_anchors(&existing);
        self.priv_ops.write_pf_conf(&content).await?;

        self.pfctl(["-f", PF_CONF], "").await?;
        Ok(())
    }

    async fn redirect_subnets(&self, subnets: &[String]) -> Result<(), Error> {
        let mut installed = self.installed.lock().await;
        if *installed == subnets {
            return Ok(());
        }

        let anchor = anchor_for_pid(std::process::id());
        let rules = render_rules(subnets, self.proxy_port);
        tracing::debug!(%rules, "loading pf rules");

        self.pfctl(["-a", &anchor, "-f", "-"], &rules).await?;
        *installed = subnets.to_vec();
        Ok(())
    }

    async fn get_nat_destination(
        &self,
        conn: TcpStream,
    ) -> Result<(SocketAddrV4, TcpStream), Error> {
        let peer = conn.peer_addr()?;
        let states = self.pfctl(["-s", "states"], "").await?;

        // the state may already have expired by the time we look
        let destination = find_nat_destination(&states.stdout, &peer.to_string())
            .ok_or(Error::StateNotFound)?;
        let destination = destination
            .parse::<SocketAddrV4>()
            .map_err(|_| Error::StateNotFound)?;
        Ok((destination, conn))
    }

    async fn shutdown(&self) -> Result<(), Error> {
        let anchor = anchor_for_pid(std::process::id());
        self.pfctl(["-F", "all", "-a", &anchor], "").await?;
        Ok(())
    }
}

fn anchor_for_pid(pid: u32) -> String {
    format!("{PRODUCT}/pid{pid}")
}

/// Re-generate /etc/pf.conf with the anchor declarations in place. Lines
/// bearing the marker are stripped first, so repeated runs never stack
/// duplicates. The declarations go right after the first existing
/// `rdr-anchor`/`anchor` line to respect pf's rule ordering constraints,
/// or at the end when none exist.
fn declare_anchors(existing: &str) -> String {
    let rdr_line = format!("rdr-anchor \"{PRODUCT}/*\"{PF_CONF_MARKER}");
    let anchor_line = format!("anchor \"{PRODUCT}/*\"{PF_CONF_MARKER}");

    let mut out = String::new();
    let mut rdr_added = false;
    let mut anchor_added = false;

    for line in existing.lines() {
        if line.contains(PF_CONF_MARKER) {
            continue;
        }
        out.push_str(line);
        out.push('\n');

        if !rdr_added && line.starts_with("rdr-anchor ") {
            out.push_str(&rdr_line);
            out.push('\n');
            rdr_added = true;
        } else if !anchor_added && line.starts_with("anchor ") {
            out.push_str(&anchor_line);
            out.push('\n');
            anchor_added = true;
        }
    }
    if !rdr_added {
        out.push_str(&rdr_line);
        out.push('\n');
    }
    if !anchor_added {
        out.push_str(&anchor_line);
        out.push('\n');
    }
    out
}

fn render_rules(subnets: &[String], proxy_port: u16) -> String {
    let mut rules = String::new();
    for subnet in subnets {
        let _ = writeln!(
            rules,
            "rdr pass on lo0 inet proto tcp from ! 127.0.0.1 to {subnet} -> 127.0.0.1 port {proxy_port}"
        );
    }
    for subnet in subnets {
        let _ = writeln!(
            rules,
            "pass out route-to lo0 inet proto tcp from any to {subnet} flags S/SA keep state"
        );
    }
    rules
}

fn find_nat_destination(states: &str, peer: &str) -> Option<String> {
    let pattern = format!(r"(?m)^ALL tcp {} -> (\S+)", regex::escape(peer));
    let re = Regex::new(&pattern).ok()?;
    re.captures(states).map(|capture| capture[1].to_string())
}
