//! Privileged requests the host sends to the guest agent.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateContainer {
    pub name: String,
    /// `repository@sha256:<hex>` or a bare `sha256:<hex>`.
    pub image: String,
    pub command: Vec<String>,
    /// `NAME=value`.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    CreateContainer(CreateContainer),
    ExecProcess {
        container: String,
        command: Vec<String>,
    },
    ReadStream {
        container: String,
    },
    CopyFile {
        path: String,
    },
}

impl AgentRequest {
    pub fn name(&self) -> &'static str {
        match self {
            AgentRequest::CreateContainer(_) => "CreateContainer",
            AgentRequest::ExecProcess { .. } => "ExecProcess",
            AgentRequest::ReadStream { .. } => "ReadStream",
            AgentRequest::CopyFile { .. } => "CopyFile",
        }
    }
}
