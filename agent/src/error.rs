use contrast_common::ContrastError;
use thiserror::Error;

/// A privileged request the policy does not permit. Each variant names the
/// rule that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnforcementError {
    #[error("container {container} is not in the policy")]
    UnknownContainer { container: String },

    #[error("image {image} is not permitted for container {container}")]
    ImageDigest { container: String, image: String },

    #[error("command {command:?} is not permitted for container {container}")]
    Command {
        container: String,
        command: Vec<String>,
    },

    #[error("environment variable {variable} is not permitted for container {container}")]
    EnvironmentVariable { container: String, variable: String },

    #[error("mount {destination} is not permitted for container {container}")]
    Mount {
        container: String,
        destination: String,
    },

    #[error("exec of {command:?} is not permitted in container {container}")]
    Exec {
        container: String,
        command: Vec<String>,
    },

    #[error("reading container output is not permitted")]
    Logs,

    #[error("copying to {destination} is not permitted")]
    CopyDestination { destination: String },

    #[error("policy was rejected at startup; every request is denied")]
    PolicyRejected,
}

impl EnforcementError {
    /// Name of the rule that failed.
    pub fn rule(&self) -> &'static str {
        match self {
            EnforcementError::UnknownContainer { .. } => "container",
            EnforcementError::ImageDigest { .. } => "image_digest",
            EnforcementError::Command { .. } => "command",
            EnforcementError::EnvironmentVariable { .. } => "env",
            EnforcementError::Mount { .. } => "mount",
            EnforcementError::Exec { .. } => "exec",
            EnforcementError::Logs => "logs",
            EnforcementError::CopyDestination { .. } => "copy_destination",
            EnforcementError::PolicyRejected => "policy",
        }
    }
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid policy document: {0}")]
    InvalidPolicy(String),

    #[error("policy digest {computed} does not match host data {host_data}")]
    DigestMismatch { computed: String, host_data: String },

    #[error("attestation report does not carry the requested report data")]
    StaleReport,

    #[error("Coordinator returned {status}: {message}")]
    Coordinator { status: u16, message: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Contrast(#[from] ContrastError),

    #[error(transparent)]
    Denied(#[from] EnforcementError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
