//! Client half of the helper channel.
//!
//! Spawns the elevated process, completes the readiness handshake and turns
//! the pipe pair into a serialised request/response channel. Responses come
//! back strictly in request order.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use std::process::Stdio;

use super::proto::{
    COMMAND_ACTION, CommandOutput, CommandRequest, CommandResponse, READY1, READY2, READY3,
    WRITE_PF_CONF_ACTION, WritePfConfRequest, WritePfConfResponse,
};
use super::{Error, PrivOps};

const SUDO_PROMPT: &str = "[local sudo] Password:";

pub struct Client {
    _child: Child,
    channel: Mutex<Channel<BufReader<ChildStdout>, ChildStdin>>,
}

impl Client {
    /// Spawn the helper and complete the readiness handshake.
    pub async fn start(log_level: &str) -> Result<Self, Error> {
        let exe = std::env::current_exe()?;

        let mut command = if running_as_root() {
            Command::new(&exe)
        } else {
            let mut command = Command::new("sudo");
            command.arg("-p").arg(SUDO_PROMPT).arg(&exe);
            command
        };
        command
            .arg("priv")
            .arg("--log-level")
            .arg(log_level)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command.spawn()?;
        let writer = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol("helper stdin is not piped".to_string()))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("helper stdout is not piped".to_string()))?;

        let mut channel = Channel::new(BufReader::new(reader), writer);
        channel.handshake().await?;
        tracing::debug!("privileged helper ready");

        Ok(Client {
            _child: child,
            channel: Mutex::new(channel),
        })
    }
}

#[async_trait]
impl PrivOps for Client {
    async fn command(&self, request: CommandRequest) -> Result<CommandOutput, Error> {
        let mut channel = self.channel.lock().await;
        let response: CommandResponse = channel.request(COMMAND_ACTION, &request).await?;
        match response {
            CommandResponse::Output(output) => Ok(output),
            CommandResponse::Refused(refused) => Err(Error::Helper(refused.error)),
        }
    }

    async fn write_pf_conf(&self, content: &str) -> Result<(), Error> {
        let request = WritePfConfRequest {
            content: content.to_string(),
        };
        let mut channel = self.channel.lock().await;
        let response: WritePfConfResponse = channel.request(WRITE_PF_CONF_ACTION, &request).await?;
        if response.error.is_empty() {
            Ok(())
        } else {
            Err(Error::Helper(response.error))
        }
    }
}

fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 && libc::getegid() == 0 }
}

/// Line-framed channel over any pipe pair.
pub(crate) struct Channel<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Channel<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(reader: R, writer: W) -> Self {
        Channel { reader, writer }
    }

    pub(crate) async fn handshake(&mut self) -> Result<(), Error> {
        let line = self.read_line().await?;
        if line != READY1 {
            return Err(Error::Protocol(format!("expected {READY1}, got {line:?}")));
        }
        self.write_line(READY2).await?;
        let line = self.read_line().await?;
        if line != READY3 {
            return Err(Error::Protocol(format!("expected {READY3}, got {line:?}")));
        }
        Ok(())
    }

    pub(crate) async fn request<Req, Resp>(
        &mut self,
        action: &str,
        request: &Req,
    ) -> Result<Resp, Error>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let frame = format!("{action}\t{}", serde_json::to_string(request)?);
        self.write_line(&frame).await?;
        let line = self.read_line().await?;
        serde_json::from_str(&line).map_err(Error::Serialization)
    }

    async fn read_line(&mut self) -> Result<String, Error> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(Error::ChannelClosed);
        }
        Ok(line.trim_end().to_string())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), Error> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}
