//! Attestation evidence as it travels between components, and the
//! report-data binding that ties a report to a nonce and to public keys.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{ContrastError, Result};
use crate::report::{SnpReport, REPORT_DATA_SIZE};
use crate::vendor::VendorChain;

/// Binding domain for workload attestation to the Coordinator.
pub const WORKLOAD_BINDING_DOMAIN: &[u8] = b"contrast-attest-v1";
/// Binding domain for the Coordinator's own attestation to relying parties.
pub const COORDINATOR_BINDING_DOMAIN: &[u8] = b"contrast-coordinator-v1";

/// Raw report plus the vendor certificates needed to verify it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Evidence {
    /// Base64 of the 1184-byte report.
    pub report: String,
    pub vendor_chain: VendorChain,
}

impl Evidence {
    pub fn new(report: &[u8], vendor_chain: VendorChain) -> Self {
        Self {
            report: BASE64.encode(report),
            vendor_chain,
        }
    }

    pub fn report_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.report)
            .map_err(|e| ContrastError::InvalidInput(format!("report is not base64: {}", e)))
    }

    pub fn parse_report(&self) -> Result<SnpReport> {
        SnpReport::from_bytes(&self.report_bytes()?)
    }
}

/// `SHA-512(domain || nonce || for each part: u32be(len) || part)`.
///
/// Length prefixes keep adjacent parts from being shifted into each other.
pub fn bind_report_data(domain: &[u8], nonce: &[u8], parts: &[&[u8]]) -> [u8; REPORT_DATA_SIZE] {
    let mut hasher = Sha512::new();
    hasher.update(domain);
    hasher.update(nonce);
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Report data a workload presents to the Coordinator: binds the nonce, the
/// key its certificate is issued for and the key its secret is sealed to.
pub fn workload_report_data(
    nonce: &[u8],
    public_key: &[u8],
    secret_key: &[u8],
) -> [u8; REPORT_DATA_SIZE] {
    let key_digest: [u8; 32] = Sha256::digest(public_key).into();
    bind_report_data(WORKLOAD_BINDING_DOMAIN, nonce, &[&key_digest, secret_key])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_is_domain_separated() {
        let nonce = [1u8; 32];
        let a = bind_report_data(WORKLOAD_BINDING_DOMAIN, &nonce, &[b"key"]);
        let b = bind_report_data(COORDINATOR_BINDING_DOMAIN, &nonce, &[b"key"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_binding_length_prefix_prevents_shifting() {
        let nonce = [1u8; 32];
        let a = bind_report_data(WORKLOAD_BINDING_DOMAIN, &nonce, &[b"ab", b"c"]);
        let b = bind_report_data(WORKLOAD_BINDING_DOMAIN, &nonce, &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_evidence_report_roundtrip() {
        let report = SnpReport::default();
        let chain = VendorChain {
            ark: String::new(),
            ask: String::new(),
            vcek: String::new(),
        };
        let evidence = Evidence::new(&report.to_bytes(), chain);
        assert_eq!(evidence.parse_report().unwrap(), report);

        let broken = Evidence {
            report: "***".to_string(),
            ..evidence
        };
        assert!(matches!(
            broken.parse_report(),
            Err(ContrastError::InvalidInput(_))
        ));
    }
}
