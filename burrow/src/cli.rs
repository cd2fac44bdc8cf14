use clap::{Args, Parser, Subcommand};

use std::net::IpAddr;
use std::time::Duration;

use cidr::Ipv4Cidr;

use burrow_lib::logging;
use burrow_lib::tunnel::chisel;

/// Transparent egress proxy tunnelling selected destinations through a
/// chisel relay.
#[derive(Debug, Parser)]
#[command(name = "burrow", version)]
pub struct Cli {
    /// Log level (one of trace, debug, info, warn and error)
    #[arg(long, global = true, default_value = logging::DEFAULT_LOG_FILTER)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Redirect traffic for the given targets through the tunnel
    Start(StartArgs),
    /// Remove firewall state left behind by crashed runs
    Cleanup,
    /// Privileged helper mode
    #[command(hide = true)]
    Priv,
    /// Print version information
    Version,
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Destination hosts or CIDR subnets to redirect
    #[arg(required = true, value_name = "TARGET")]
    pub targets: Vec<String>,

    /// URL of the chisel server acting as remote relay
    #[arg(long)]
    pub chisel_server: String,

    /// Port the local proxy listens on (0 allocates a free port)
    #[arg(long, default_value_t = 0)]
    pub listen_port: u16,

    /// Host the local proxy listens on
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_host: IpAddr,

    /// How often targets are re-resolved
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub dns_check_interval: Duration,

    /// Subnets to exclude from redirection
    #[arg(long = "exclude-subnet", value_name = "CIDR")]
    pub exclude_subnets: Vec<Ipv4Cidr>,

    /// Chisel client executable to spawn for tunnel streams
    #[arg(long, default_value = chisel::DEFAULT_BINARY)]
    pub chisel_binary: String,

    /// Fingerprint pinning the chisel server's key
    #[arg(long)]
    pub chisel_fingerprint: Option<String>,

    /// Credential in user:pass form
    #[arg(long, env = chisel::AUTH_ENV_VAR)]
    pub chisel_auth: Option<String>,

    /// Keepalive interval on the tunnel connection
    #[arg(long, value_parser = humantime::parse_duration)]
    pub chisel_keepalive: Option<Duration>,

    /// Give up reconnecting after this many attempts
    #[arg(long)]
    pub chisel_max_retry_count: Option<i32>,

    /// Upper bound on the reconnect backoff
    #[arg(long, value_parser = humantime::parse_duration)]
    pub chisel_max_retry_interval: Option<Duration>,

    /// Proxy URL used to reach the chisel server
    #[arg(long)]
    pub chisel_proxy: Option<String>,

    /// Host header override for the chisel handshake
    #[arg(long)]
    pub chisel_hostname: Option<String>,
}

impl StartArgs {
    pub fn tunnel_config(&self) -> chisel::Config {
        chisel::Config {
            server: self.chisel_server.clone(),
            binary: self.chisel_binary.clone(),
            fingerprint: self.chisel_fingerprint.clone(),
            auth: self.chisel_auth.clone(),
            keepalive: self.chisel_keepalive,
            max_retry_count: self.chisel_max_retry_count,
            max_retry_interval: self.chisel_max_retry_interval,
            proxy: self.chisel_proxy.clone(),
            hostname: self.chisel_hostname.clone(),
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_minimum_arguments() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "burrow",
            "start",
            "--chisel-server",
            "https://relay.example.test",
            "internal.example.test",
        ])?;

        let Command::Start(args) = cli.command else {
            panic!("expected start command");
        };
        assert_eq!(args.targets, vec!["internal.example.test"]);
        assert_eq!(args.listen_port, 0);
        assert_eq!(args.listen_host.to_string(), "127.0.0.1");
        assert_eq!(args.dns_check_interval, Duration::from_secs(300));
        assert_eq!(args.chisel_binary, chisel::DEFAULT_BINARY);
        Ok(())
    }

    #[test]
    fn start_requires_a_target() {
        let parsed = Cli::try_parse_from([
            "burrow",
            "start",
            "--chisel-server",
            "https://relay.example.test",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn start_requires_the_chisel_server() {
        let parsed = Cli::try_parse_from(["burrow", "start", "internal.example.test"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parses_exclude_subnets_as_cidrs() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "burrow",
            "start",
            "--chisel-server",
            "https://relay.example.test",
            "--exclude-subnet",
            "10.0.0.0/8",
            "--exclude-subnet",
            "192.0.2.0/24",
            "internal.example.test",
        ])?;

        let Command::Start(args) = cli.command else {
            panic!("expected start command");
        };
        assert_eq!(args.exclude_subnets.len(), 2);
        assert_eq!(args.exclude_subnets[0].to_string(), "10.0.0.0/8");
        Ok(())
    }

    #[test]
    fn tunnel_config_carries_passthrough_flags() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "burrow",
            "start",
            "--chisel-server",
            "https://relay.example.test",
            "--chisel-auth",
            "user:pass",
            "--chisel-keepalive",
            "25s",
            "internal.example.test",
        ])?;

        let Command::Start(args) = cli.command else {
            panic!("expected start command");
        };
        let config = args.tunnel_config();
        assert_eq!(config.server, "https://relay.example.test");
        assert_eq!(config.auth.as_deref(), Some("user:pass"));
        assert_eq!(config.keepalive, Some(Duration::from_secs(25)));
        Ok(())
    }

    #[test]
    fn log_level_is_global() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["burrow", "cleanup", "--log-level", "debug"])?;
        assert_eq!(cli.log_level, "debug");
        Ok(())
    }
}
