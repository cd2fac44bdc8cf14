//! Wire types for the helper channel.
//!
//! One request per line: `<action>\t<json>`. One JSON response per line.
//! The channel starts with a three-step readiness exchange confirming that
//! elevation succeeded and both pipes are live.

use serde::{Deserialize, Serialize};

pub const COMMAND_ACTION: &str = "command";
pub const WRITE_PF_CONF_ACTION: &str = "writePfConf";

pub const READY1: &str = "ready1";
pub const READY2: &str = "ready2";
pub const READY3: &str = "ready3";

/// Programs the helper will execute on behalf of the client. Everything
/// else is refused.
pub const ALLOWED_COMMANDS: [&str; 2] = ["iptables", "pfctl"];

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Output(CommandOutput),
    Refused(ErrorResponse),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WritePfConfRequest {
    pub content: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WritePfConfResponse {
    #[serde(default)]
    pub error: String,
}
