//! Stateful test doubles shared by the nat, resolver and proxy tests.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::privsep::{self, CommandOutput, CommandRequest, PrivOps};

use super::{Error, Nat};

/// Records every command sent through the helper channel and replays canned
/// outputs in order (empty success when the queue runs dry).
#[derive(Default)]
pub(crate) struct RecordingPriv {
    pub commands: Mutex<Vec<CommandRequest>>,
    pub outputs: Mutex<VecDeque<CommandOutput>>,
    pub pf_conf: Mutex<Option<String>>,
}

impl RecordingPriv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_output(&self, output: CommandOutput) {
        self.outputs.lock().unwrap().push_back(output);
    }

    pub fn push_stdout(&self, stdout: &str) {
        self.push_output(CommandOutput {
            stdout: stdout.to_string(),
            ..CommandOutput::default()
        });
    }

    /// The recorded calls as `command arg arg…` strings.
    pub fn command_lines(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|request| {
                let mut line = request.command.clone();
                for arg in &request.args {
                    line.push(' ');
                    line.push_str(arg);
                }
                line
            })
            .collect()
    }

    pub fn stdins(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.stdin.clone())
            .collect()
    }
}

#[async_trait]
impl PrivOps for RecordingPriv {
    async fn command(&self, request: CommandRequest) -> Result<CommandOutput, privsep::Error> {
        self.commands.lock().unwrap().push(request);
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn write_pf_conf(&self, content: &str) -> Result<(), privsep::Error> {
        *self.pf_conf.lock().unwrap() = Some(content.to_string());
        Ok(())
    }
}

/// NAT double recording every pushed subnet set; destination recovery hands
/// back a fixed address.
#[derive(Default)]
pub(crate) struct MockNat {
    pub pushed: Mutex<Vec<Vec<String>>>,
    pub destination: Option<SocketAddrV4>,
}

impl MockNat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_destination(destination: SocketAddrV4) -> Arc<Self> {
        Arc::new(MockNat {
            pushed: Mutex::new(Vec::new()),
            destination: Some(destination),
        })
    }
}

#[async_trait]
impl Nat for MockNat {
    async fn cleanup(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn setup(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn redirect_subnets(&self, subnets: &[String]) -> Result<(), Error> {
        self.pushed.lock().unwrap().push(subnets.to_vec());
        Ok(())
    }

    async fn get_nat_destination(
        &self,
        conn: TcpStream,
    ) -> Result<(SocketAddrV4, TcpStream), Error> {
        match self.destination {
            Some(destination) => Ok((destination, conn)),
            None => Err(Error::StateNotFound),
        }
    }

    async fn shutdown(&self) -> Result<(), Error> {
        Ok(())
    }
}
