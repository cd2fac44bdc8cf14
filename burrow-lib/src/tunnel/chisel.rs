//! Tunnel transport backed by the external chisel client.
//!
//! Each stream is a `chisel client … stdio:<host>:<port>` child process:
//! its stdout and stdin are the stream's two byte pipes, its stderr is
//! surfaced through the log. Dropping the stream kills the child.

use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};

use super::{Error, Tunnel, TunnelStream};

/// Environment variable supplying the tunnel credential when the flag is
/// absent. Chisel itself reads the same variable.
pub const AUTH_ENV_VAR: &str = "AUTH";

pub const DEFAULT_BINARY: &str = "chisel";

#[derive(Clone, Debug)]
pub struct Config {
    pub server: String,
    pub binary: String,
    pub fingerprint: Option<String>,
    pub auth: Option<String>,
    pub keepalive: Option<Duration>,
    pub max_retry_count: Option<i32>,
    pub max_retry_interval: Option<Duration>,
    pub proxy: Option<String>,
    pub hostname: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: String::new(),
            binary: DEFAULT_BINARY.to_string(),
            fingerprint: None,
            auth: None,
            keepalive: None,
            max_retry_count: None,
            max_retry_interval: None,
            proxy: None,
            hostname: None,
        }
    }
}

pub struct ChiselTunnel {
    config: Config,
}

impl ChiselTunnel {
    pub fn new(config: Config) -> Self {
        ChiselTunnel { config }
    }
}

#[async_trait]
impl Tunnel for ChiselTunnel {
    async fn create_stream(&self, host: &str, port: u16) -> Result<TunnelStream, Error> {
        let mut command = Command::new(&self.config.binary);
        command
            .args(client_args(&self.config, host, port))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("chisel stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("chisel stdout is not piped"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        Ok(TunnelStream {
            reader: Box::new(stdout),
            writer: Box::new(ChiselWriter {
                _child: child,
                stdin,
            }),
        })
    }
}

fn client_args(config: &Config, host: &str, port: u16) -> Vec<String> {
    let mut args = vec!["client".to_string()];
    if let Some(fingerprint) = &config.fingerprint {
        args.push("--fingerprint".to_string());
        args.push(fingerprint.clone());
    }
    if let Some(auth) = &config.auth {
        args.push("--auth".to_string());
        args.push(auth.clone());
    }
    if let Some(keepalive) = config.keepalive {
        args.push("--keepalive".to_string());
        args.push(format!("{}s", keepalive.as_secs()));
    }
    if let Some(count) = config.max_retry_count {
        args.push("--max-retry-count".to_string());
        args.push(count.to_string());
    }
    if let Some(interval) = config.max_retry_interval {
        args.push("--max-retry-interval".to_string());
        args.push(format!("{}s", interval.as_secs()));
    }
    if let Some(proxy) = &config.proxy {
        args.push("--proxy".to_string());
        args.push(proxy.clone());
    }
    if let Some(hostname) = &config.hostname {
        args.push("--hostname".to_string());
        args.push(hostname.clone());
    }
    args.push(config.server.clone());
    args.push(format!("stdio:{host}:{port}"));
    args
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(from = "chisel", "{line}");
    }
}

/// Outbound pipe of a stream. Owns the child so the process lives exactly
/// as long as the stream does.
struct ChiselWriter {
    _child: Child,
    stdin: ChildStdin,
}

impl AsyncWrite for ChiselWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
