//! Server half of the helper channel. Runs in the elevated `priv` process.
//!
//! Reads one request per line from stdin and writes one JSON response per
//! line to stdout. Only `iptables` and `pfctl` are ever executed; anything
//! else gets an error response while the loop keeps serving. A malformed
//! frame is fatal.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

use std::path::PathBuf;
use std::process::Stdio;

use super::Error;
use super::proto::{
    ALLOWED_COMMANDS, COMMAND_ACTION, CommandOutput, CommandRequest, CommandResponse,
    ErrorResponse, READY1, READY2, READY3, WRITE_PF_CONF_ACTION, WritePfConfRequest,
    WritePfConfResponse,
};

const PF_CONF_PATH: &str = "/etc/pf.conf";

pub struct Server {
    pf_conf_path: PathBuf,
}

impl Server {
    pub fn new() -> Self {
        Server {
            pf_conf_path: PathBuf::from(PF_CONF_PATH),
        }
    }

    /// Serve requests on stdin/stdout until the parent closes the pipe.
    pub async fn run(&self) -> Result<(), Error> {
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    pub(crate) async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<(), Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        write_line(&mut writer, READY1).await?;
        match read_line(&mut reader).await? {
            Some(line) if line == READY2 => (),
            Some(line) => {
                return Err(Error::Protocol(format!("expected {READY2}, got {line:?}")));
            }
            None => return Err(Error::Protocol("pipe closed during handshake".to_string())),
        }
        write_line(&mut writer, READY3).await?;

        loop {
            let Some(line) = read_line(&mut reader).await? else {
                tracing::debug!("request pipe closed, exiting");
                return Ok(());
            };
            let (action, request) = line
                .split_once('\t')
                .ok_or_else(|| Error::Protocol(format!("malformed frame: {line:?}")))?;
            tracing::debug!(action, request, "received request");

            let response = match action {
                COMMAND_ACTION => serde_json::to_string(&handle_command(request).await?)?,
                WRITE_PF_CONF_ACTION => {
                    serde_json::to_string(&self.handle_write_pf_conf(request).await?)?
                }
                other => return Err(Error::Protocol(format!("unknown action {other:?}"))),
            };
            write_line(&mut writer, &response).await?;
        }
    }

    async fn handle_write_pf_conf(&self, request: &str) -> Result<WritePfConfResponse, Error> {
        let request: WritePfConfRequest = serde_json::from_str(request)?;
        tracing::debug!(path = %self.pf_conf_path.display(), "replacing pf configuration");

        match self.replace_pf_conf(&request.content).await {
            Ok(()) => Ok(WritePfConfResponse::default()),
            Err(error) => Ok(WritePfConfResponse {
                error: error.to_string(),
            }),
        }
    }

    /// Temp-then-rename so a crash mid-write never leaves a truncated
    /// firewall configuration behind.
    async fn replace_pf_conf(&self, content: &str) -> std::io::Result<()> {
        let tmp = PathBuf::from(format!("{}.tmp", self.pf_conf_path.display()));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.pf_conf_path).await
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_command(request: &str) -> Result<CommandResponse, Error> {
    let request: CommandRequest = serde_json::from_str(request)?;

    if !ALLOWED_COMMANDS.contains(&request.command.as_str()) {
        return Ok(CommandResponse::Refused(ErrorResponse {
            error: format!("{} is not allowed", request.command),
        }));
    }

    tracing::debug!(command = %request.command, args = ?request.args, "running command");

    let spawned = Command::new(&request.command)
        .args(&request.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(error) => {
            return Ok(CommandResponse::Output(CommandOutput {
                stdout: String::new(),
                stderr: error.to_string(),
                exit_code: -1,
            }));
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(request.stdin.as_bytes()).await?;
        // dropping the handle closes the child's stdin
    }

    let output = child.wait_with_output().await?;
    Ok(CommandResponse::Output(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    }))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>, Error> {
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end().to_string()))
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), Error> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    async fn drive<const N: usize>(
        server: Server,
        frames: [&str; N],
    ) -> (Result<(), Error>, Vec<String>) {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        let handle = tokio::spawn(async move {
            server
                .serve(BufReader::new(server_read), server_write)
                .await
        });

        let (client_read, mut client_write) = tokio::io::split(client_io);
        let mut reader = BufReader::new(client_read);

        let greeting = read_line(&mut reader).await.expect("read").expect("line");
        assert_eq!(greeting, READY1);
        write_line(&mut client_write, READY2).await.expect("write");
        let greeting = read_line(&mut reader).await.expect("read").expect("line");
        assert_eq!(greeting, READY3);

        let mut responses = Vec::new();
        for frame in frames {
            write_line(&mut client_write, frame).await.expect("write");
            match read_line(&mut reader).await.expect("read") {
                Some(response) => responses.push(response),
                None => break,
            }
        }
        client_write.shutdown().await.expect("shutdown");
        let mut rest = String::new();
        let _ = reader.read_to_string(&mut rest).await;

        (handle.await.expect("serve task"), responses)
    }

    #[tokio::test]
    async fn survives_refused_commands() {
        let request = format!(
            "{COMMAND_ACTION}\t{}",
            serde_json::to_string(&CommandRequest {
                command: "rm".to_string(),
                args: vec!["-rf".to_string()],
                stdin: String::new(),
            })
            .expect("serialize")
        );
        let (result, responses) = drive(Server::new(), [request.as_str(), request.as_str()]).await;

        assert!(result.is_ok());
        assert_eq!(responses.len(), 2);
        for response in responses {
            let response: CommandResponse = serde_json::from_str(&response).expect("response");
            match response {
                CommandResponse::Refused(refused) => {
                    assert_eq!(refused.error, "rm is not allowed")
                }
                CommandResponse::Output(_) => panic!("expected refusal"),
            }
        }
    }

    #[tokio::test]
    async fn fails_on_frame_without_action_separator() {
        let (result, responses) = drive(Server::new(), ["no-tab-here"]).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn fails_on_unknown_action() {
        let (result, responses) = drive(Server::new(), ["reboot\t{}"]).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn fails_on_bad_handshake_reply() {
        let server = Server::new();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        let handle = tokio::spawn(async move {
            server
                .serve(BufReader::new(server_read), server_write)
                .await
        });

        let (client_read, mut client_write) = tokio::io::split(client_io);
        let mut reader = BufReader::new(client_read);
        let _ = read_line(&mut reader).await.expect("read");
        write_line(&mut client_write, "nonsense").await.expect("write");

        let result = handle.await.expect("serve task");
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn replaces_pf_conf_atomically() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("pf.conf");
        std::fs::write(&path, "old rules\n").expect("seed");

        let server = Server {
            pf_conf_path: path.clone(),
        };
        let request = format!(
            "{WRITE_PF_CONF_ACTION}\t{}",
            serde_json::to_string(&WritePfConfRequest {
                content: "new rules\n".to_string(),
            })
            .expect("serialize")
        );
        let (result, responses) = drive(server, [request.as_str()]).await;

        assert!(result.is_ok());
        let response: WritePfConfResponse =
            serde_json::from_str(&responses[0]).expect("response");
        assert!(response.error.is_empty());
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "new rules\n");
        assert!(!dir.path().join("pf.conf.tmp").exists());
    }

    #[tokio::test]
    async fn reports_write_failure_in_response() {
        let dir = tempdir().expect("tempdir");
        // parent directory does not exist, the write must fail
        let server = Server {
            pf_conf_path: dir.path().join("missing").join("pf.conf"),
        };
        let request = format!(
            "{WRITE_PF_CONF_ACTION}\t{}",
            serde_json::to_string(&WritePfConfRequest {
                content: "rules\n".to_string(),
            })
            .expect("serialize")
        );
        let (result, responses) = drive(server, [request.as_str()]).await;

        assert!(result.is_ok());
        let response: WritePfConfResponse =
            serde_json::from_str(&responses[0]).expect("response");
        assert!(!response.error.is_empty());
    }
}
