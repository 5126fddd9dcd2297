use thiserror::Error;

use crate::verify::VerificationError;

/// Errors shared by the Coordinator, the CLI and the guest-side components.
#[derive(Error, Debug, Clone)]
pub enum ContrastError {
    // Input validation
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid policy document: {0}")]
    InvalidPolicy(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Attestation
    #[error("Attestation rejected: {0}")]
    Verification(#[from] VerificationError),

    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    // Coordinator state
    #[error("Coordinator has no manifest set")]
    NoManifest,

    #[error("Coordinator is not recovered; run recovery with the secret seed")]
    NotRecovered,

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Manifest conflict: {0}")]
    ManifestConflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    // System
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContrastError {
    /// Returns a stable numeric error code for this error variant.
    ///
    /// Code ranges:
    /// - 1000-1099: Input (manifest, policy, requests)
    /// - 1100-1199: Attestation and cryptography
    /// - 1200-1299: Coordinator state and authorization
    /// - 1400-1499: System (storage, IO, config)
    /// - 1500-1599: Transient (network, timeout, resources)
    /// - 1900-1999: Internal
    pub fn code(&self) -> u16 {
        match self {
            ContrastError::InvalidManifest(_) => 1001,
            ContrastError::InvalidPolicy(_) => 1002,
            ContrastError::InvalidInput(_) => 1003,

            ContrastError::Verification(e) => e.code(),
            ContrastError::EncryptionError(_) => 1150,
            ContrastError::DecryptionError(_) => 1151,
            ContrastError::CertificateError(_) => 1152,
            ContrastError::KeyDerivation(_) => 1153,

            ContrastError::NoManifest => 1200,
            ContrastError::NotRecovered => 1201,
            ContrastError::InvalidState(_) => 1202,
            ContrastError::ManifestConflict(_) => 1203,
            ContrastError::Unauthorized(_) => 1204,
            ContrastError::RecoveryFailed(_) => 1205,

            ContrastError::StorageError(_) => 1400,
            ContrastError::IoError(_) => 1401,
            ContrastError::SerializationError(_) => 1402,
            ContrastError::ConfigurationError(_) => 1403,

            ContrastError::NetworkError(_) => 1500,
            ContrastError::Timeout(_) => 1501,
            ContrastError::ResourceExhausted(_) => 1502,

            ContrastError::Internal(_) => 1900,
        }
    }

    /// Returns a structured error string in the format "E{code}: {redacted_message}".
    ///
    /// Safe for external consumption (logs, exit messages, API responses).
    pub fn to_structured(&self) -> String {
        format!("E{}: {}", self.code(), self.to_redacted_string())
    }

    /// Returns a message safe for remote callers.
    ///
    /// Verification and state errors keep their details: they carry public
    /// report fields and tell operators what to fix. Errors that may embed
    /// paths, key parsing output or decrypted material are reduced to a
    /// generic phrase.
    pub fn to_redacted_string(&self) -> String {
        match self {
            ContrastError::InvalidManifest(msg) => format!("Invalid manifest: {}", msg),
            ContrastError::InvalidPolicy(msg) => format!("Invalid policy document: {}", msg),
            ContrastError::InvalidInput(msg) => format!("Invalid input: {}", msg),

            ContrastError::Verification(e) => format!("Attestation rejected: {}", e),
            ContrastError::EncryptionError(_) => "Encryption operation failed".to_string(),
            ContrastError::DecryptionError(_) => "Decryption operation failed".to_string(),
            ContrastError::CertificateError(_) => "Certificate operation failed".to_string(),
            ContrastError::KeyDerivation(_) => "Key derivation failed".to_string(),

            ContrastError::NoManifest
            | ContrastError::NotRecovered
            | ContrastError::InvalidState(_)
            | ContrastError::ManifestConflict(_)
            | ContrastError::Unauthorized(_) => self.to_string(),
            ContrastError::RecoveryFailed(_) => "Recovery failed".to_string(),

            ContrastError::StorageError(_) => "Storage operation failed".to_string(),
            ContrastError::IoError(_) => "I/O error".to_string(),
            ContrastError::SerializationError(_) => "Data format error".to_string(),
            ContrastError::ConfigurationError(_) => "Configuration error".to_string(),

            ContrastError::NetworkError(_) => "Network error".to_string(),
            ContrastError::Timeout(_) => "Operation timed out".to_string(),
            ContrastError::ResourceExhausted(_) => "Resource limit exceeded".to_string(),

            ContrastError::Internal(_) => "Internal error".to_string(),
        }
    }

    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            ContrastError::InvalidManifest(_) => "invalid_manifest",
            ContrastError::InvalidPolicy(_) => "invalid_policy",
            ContrastError::InvalidInput(_) => "invalid_input",
            ContrastError::Verification(e) => e.kind(),
            ContrastError::EncryptionError(_)
            | ContrastError::DecryptionError(_)
            | ContrastError::CertificateError(_)
            | ContrastError::KeyDerivation(_) => "crypto",
            ContrastError::NoManifest => "no_manifest",
            ContrastError::NotRecovered => "not_recovered",
            ContrastError::InvalidState(_) => "invalid_state",
            ContrastError::ManifestConflict(_) => "manifest_conflict",
            ContrastError::Unauthorized(_) => "unauthorized",
            ContrastError::RecoveryFailed(_) => "recovery_failed",
            ContrastError::StorageError(_)
            | ContrastError::IoError(_)
            | ContrastError::SerializationError(_)
            | ContrastError::ConfigurationError(_) => "system",
            ContrastError::NetworkError(_) => "network",
            ContrastError::Timeout(_) => "timeout",
            ContrastError::ResourceExhausted(_) => "resource_exhausted",
            ContrastError::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the same operation with a fresh challenge.
    pub fn is_retryable(&self) -> bool {
        match self {
            ContrastError::Verification(e) => e.is_retryable(),
            ContrastError::NetworkError(_)
            | ContrastError::Timeout(_)
            | ContrastError::ResourceExhausted(_)
            | ContrastError::ManifestConflict(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for ContrastError {
    fn from(err: std::io::Error) -> Self {
        ContrastError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ContrastError {
    fn from(err: serde_json::Error) -> Self {
        ContrastError::SerializationError(err.to_string())
    }
}

impl From<rcgen::Error> for ContrastError {
    fn from(err: rcgen::Error) -> Self {
        ContrastError::CertificateError(err.to_string())
    }
}

/// Result type used across the workspace.
pub type Result<T> = std::result::Result<T, ContrastError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<ContrastError> {
        vec![
            ContrastError::InvalidManifest(String::new()),
            ContrastError::InvalidPolicy(String::new()),
            ContrastError::InvalidInput(String::new()),
            ContrastError::Verification(VerificationError::UnknownPolicyDigest {
                digest: String::new(),
            }),
            ContrastError::EncryptionError(String::new()),
            ContrastError::DecryptionError(String::new()),
            ContrastError::CertificateError(String::new()),
            ContrastError::KeyDerivation(String::new()),
            ContrastError::NoManifest,
            ContrastError::NotRecovered,
            ContrastError::InvalidState(String::new()),
            ContrastError::ManifestConflict(String::new()),
            ContrastError::Unauthorized(String::new()),
            ContrastError::RecoveryFailed(String::new()),
            ContrastError::StorageError(String::new()),
            ContrastError::IoError(String::new()),
            ContrastError::SerializationError(String::new()),
            ContrastError::ConfigurationError(String::new()),
            ContrastError::NetworkError(String::new()),
            ContrastError::Timeout(String::new()),
            ContrastError::ResourceExhausted(String::new()),
            ContrastError::Internal(String::new()),
        ]
    }

    #[test]
    fn test_error_codes_unique() {
        let variants = all_variants();
        let mut codes: Vec<u16> = variants.iter().map(|v| v.code()).collect();
        let len = codes.len();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), len, "duplicate error codes found");
    }

    #[test]
    fn test_structured_format() {
        let err = ContrastError::NotRecovered;
        let s = err.to_structured();
        assert!(s.starts_with("E1201: "));
        assert!(s.contains("recovery"));
    }

    #[test]
    fn test_redaction_hides_internal_details() {
        let err = ContrastError::RecoveryFailed("seed 00ff00ff did not match".to_string());
        assert!(!err.to_redacted_string().contains("00ff00ff"));

        let err = ContrastError::StorageError("/var/lib/contrast/transitions/latest".to_string());
        assert!(!err.to_redacted_string().contains("/var/lib"));
    }

    #[test]
    fn test_verification_details_survive_redaction() {
        let err: ContrastError = VerificationError::ReferenceMismatch {
            field: "reported_tcb.snp".to_string(),
            expected: ">= 8".to_string(),
            observed: "7".to_string(),
        }
        .into();
        let redacted = err.to_redacted_string();
        assert!(redacted.contains("reported_tcb.snp"));
        assert!(redacted.contains(">= 8"));
        assert!(redacted.contains('7'));
    }

    #[test]
    fn test_not_recovered_distinct_from_attestation_failure() {
        let state = ContrastError::NotRecovered;
        let attest: ContrastError = VerificationError::BadSignature {
            reason: "x".to_string(),
        }
        .into();
        assert_ne!(state.kind(), attest.kind());
        assert_ne!(state.code() / 100, attest.code() / 100);
    }
}
