use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Audit log entry for security events
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuditLogEntry {
    pub entry_id: String,
    pub timestamp: u64,
    pub event_type: AuditEventType,
    /// Hex policy digest of the workload, when the event concerns one.
    pub policy_digest: Option<String>,
    /// Hex hash of the manifest active when the event happened.
    pub manifest_hash: Option<String>,
    pub details: BTreeMap<String, serde_json::Value>,
    pub severity: AuditSeverity,
}

/// Types of audit events
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum AuditEventType {
    ManifestSet,
    ManifestRejected,
    CertificateIssued,
    AttestationRejected,
    CoordinatorAttested,
    RecoverySucceeded,
    RecoveryFailed,
}

/// Severity levels for audit events
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditLogEntry {
    pub fn new(event_type: AuditEventType, severity: AuditSeverity) -> Self {
        Self {
            entry_id: crate::generate_id(),
            timestamp: crate::current_timestamp(),
            event_type,
            policy_digest: None,
            manifest_hash: None,
            details: BTreeMap::new(),
            severity,
        }
    }

    pub fn with_policy_digest(mut self, digest: impl Into<String>) -> Self {
        self.policy_digest = Some(digest.into());
        self
    }

    pub fn with_manifest_hash(mut self, hash: &[u8; 32]) -> Self {
        self.manifest_hash = Some(hex::encode(hash));
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}
