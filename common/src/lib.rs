pub mod api;
pub mod ca;
pub mod crypto;
pub mod error;
pub mod evidence;
pub mod history;
pub mod issuer;
pub mod manifest;
pub mod policy;
pub mod report;
pub mod seed;
pub mod seedshare;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod types;
pub mod vendor;
pub mod verify;

// Re-export commonly used types and errors
pub use error::{ContrastError, Result};

pub use types::{AuditEventType, AuditLogEntry, AuditSeverity};

pub use evidence::{
    bind_report_data, workload_report_data, Evidence, COORDINATOR_BINDING_DOMAIN,
    WORKLOAD_BINDING_DOMAIN,
};
pub use issuer::{ConfigfsTsmIssuer, LaunchParameters, ReportIssuer, SimulatedIssuer};
pub use manifest::{HexString, Manifest, PolicyEntry, Role, UpdateAuthorization};
pub use policy::{PolicyDigest, PolicyDocument};
pub use report::{SnpReport, TcbVersion};
pub use vendor::{SimulatedPlatform, VendorChain};
pub use verify::{
    verify_evidence, Composed, ExpectedPolicyVerifier, HardwareReportVerifier,
    ManifestPolicyVerifier, ReportDataVerifier, VerificationError, Verifier,
};

/// Version information for the common crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of nonces issued for attestation freshness.
pub const NONCE_SIZE: usize = 32;

/// Generate a new UUID v4 string
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Get current Unix timestamp
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate a cryptographically secure random nonce
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    use rand::rngs::OsRng;
    use rand::RngCore;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
