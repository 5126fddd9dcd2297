//! Execution policy documents and their digests.
//!
//! The digest is computed over the exact bytes handed to the hardware root as
//! host data, never over a re-serialization. Two documents that parse to the
//! same rules but differ in a single byte have different digests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ContrastError, Result};
use crate::manifest::HexString;

pub const POLICY_VERSION: u32 = 1;

/// SHA-256 of a policy document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyDigest(pub [u8; 32]);

impl PolicyDigest {
    pub fn of(document_bytes: &[u8]) -> Self {
        Self(Sha256::digest(document_bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> HexString {
        HexString::from_bytes(&self.0)
    }
}

impl std::fmt::Display for PolicyDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Static rules shared by every container of the pod.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyRules {
    /// Allow `ExecProcess` at all. Each command must still be listed per container.
    #[serde(default)]
    pub allow_exec: bool,
    /// Allow the host to read container stdout/stderr.
    #[serde(default)]
    pub allow_logs: bool,
    /// Path prefixes the host may copy files into.
    #[serde(default)]
    pub allowed_copy_destinations: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MountRule {
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
}

/// What one container may be started with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerPolicy {
    pub name: String,
    /// Allowed image digests, `sha256:<hex>`.
    pub image_digests: Vec<String>,
    /// Exact command line (entrypoint followed by arguments).
    pub command: Vec<String>,
    /// `NAME=value` for an exact value, `NAME=*` for any value.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<MountRule>,
    /// Command lines permitted for `ExecProcess`.
    #[serde(default)]
    pub exec_commands: Vec<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyData {
    pub containers: Vec<ContainerPolicy>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PolicyDocument {
    pub version: u32,
    pub rules: PolicyRules,
    pub data: PolicyData,
}

impl PolicyDocument {
    pub fn new(rules: PolicyRules, containers: Vec<ContainerPolicy>) -> Self {
        Self {
            version: POLICY_VERSION,
            rules,
            data: PolicyData { containers },
        }
    }

    /// Parse and validate raw document bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let doc: PolicyDocument = serde_json::from_slice(bytes)
            .map_err(|e| ContrastError::InvalidPolicy(format!("parse error: {}", e)))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Serialize to the bytes that become host data.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != POLICY_VERSION {
            return Err(ContrastError::InvalidPolicy(format!(
                "unsupported policy version {}",
                self.version
            )));
        }
        if self.data.containers.is_empty() {
            return Err(ContrastError::InvalidPolicy(
                "policy permits no containers".to_string(),
            ));
        }
        for c in &self.data.containers {
            if c.image_digests.is_empty() {
                return Err(ContrastError::InvalidPolicy(format!(
                    "container {} has no image digest",
                    c.name
                )));
            }
            if let Some(bad) = c.image_digests.iter().find(|d| !is_image_digest(d)) {
                return Err(ContrastError::InvalidPolicy(format!(
                    "container {} has malformed image digest {}",
                    c.name, bad
                )));
            }
            if let Some(bad) = c.env.iter().find(|e| !e.contains('=')) {
                return Err(ContrastError::InvalidPolicy(format!(
                    "container {} has malformed env rule {}",
                    c.name, bad
                )));
            }
        }
        Ok(())
    }

    pub fn container(&self, name: &str) -> Option<&ContainerPolicy> {
        self.data.containers.iter().find(|c| c.name == name)
    }
}

/// `sha256:` followed by 64 hex characters.
pub fn is_image_digest(s: &str) -> bool {
    match s.strip_prefix("sha256:") {
        Some(h) => h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}
