//! JSON bodies of the Coordinator HTTP API, shared by the server, the CLI and
//! the initializer.

use serde::{Deserialize, Serialize};

use crate::error::ContrastError;
use crate::evidence::{bind_report_data, Evidence, COORDINATOR_BINDING_DOMAIN};
use crate::manifest::{HexString, Manifest, UpdateAuthorization};
use crate::report::REPORT_DATA_SIZE;
use crate::seedshare::SeedShareDocument;

pub const NONCE_PATH: &str = "/api/v1/nonce";
pub const ATTEST_PATH: &str = "/api/v1/attest";
pub const ATTESTATION_PATH: &str = "/api/v1/attestation";
pub const MANIFESTS_PATH: &str = "/api/v1/manifests";
pub const MANIFEST_PATH: &str = "/api/v1/manifest";
pub const RECOVER_PATH: &str = "/api/v1/recover";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub phase: String,
    pub version: String,
    /// Audit entries the file sink failed to persist; nonzero reports "degraded".
    #[serde(default)]
    pub audit_sink_failures: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NonceResponse {
    pub nonce: HexString,
    pub expires_in_secs: u64,
}

/// Workload attestation. `report_data` of the evidence must equal
/// `bind_report_data(WORKLOAD_BINDING_DOMAIN, nonce, [sha256(public_key), secret_key])`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AttestRequest {
    pub evidence: Evidence,
    pub nonce: HexString,
    /// Ed25519 key the certificate is issued for.
    pub public_key: HexString,
    /// X25519 key the workload secret is sealed to.
    pub secret_key: HexString,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AttestResponse {
    pub certificate: String,
    pub mesh_ca: String,
    pub root_ca: String,
    /// HPKE-sealed workload secret, if the policy names one.
    #[serde(default)]
    pub workload_secret: Option<HexString>,
    pub generation: u64,
    pub manifest_hash: HexString,
}

/// The Coordinator's own evidence. `report_data` equals
/// `bind_report_data(COORDINATOR_BINDING_DOMAIN, nonce, [transport_key, root_ca, mesh_ca, manifest_hash])`
/// with absent values bound as empty strings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoordinatorAttestation {
    pub evidence: Evidence,
    pub transport_key: HexString,
    pub phase: String,
    #[serde(default)]
    pub root_ca: Option<String>,
    #[serde(default)]
    pub mesh_ca: Option<String>,
    #[serde(default)]
    pub manifest_hash: Option<HexString>,
}

impl CoordinatorAttestation {
    /// Report data this attestation must carry for `nonce`.
    pub fn expected_report_data(&self, nonce: &[u8]) -> [u8; REPORT_DATA_SIZE] {
        let manifest_hash = self.manifest_hash.as_ref().map(HexString::to_bytes);
        coordinator_report_data(
            nonce,
            &self.transport_key.to_bytes(),
            self.root_ca.as_deref(),
            self.mesh_ca.as_deref(),
            manifest_hash.as_deref(),
        )
    }
}

pub fn coordinator_report_data(
    nonce: &[u8],
    transport_key: &[u8],
    root_ca: Option<&str>,
    mesh_ca: Option<&str>,
    manifest_hash: Option<&[u8]>,
) -> [u8; REPORT_DATA_SIZE] {
    bind_report_data(
        COORDINATOR_BINDING_DOMAIN,
        nonce,
        &[
            transport_key,
            root_ca.unwrap_or_default().as_bytes(),
            mesh_ca.unwrap_or_default().as_bytes(),
            manifest_hash.unwrap_or_default(),
        ],
    )
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AttestationQuery {
    pub nonce: HexString,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ManifestsResponse {
    /// Oldest first.
    pub manifests: Vec<Manifest>,
    pub root_ca: String,
    pub mesh_ca: String,
    pub generation: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetManifestRequest {
    pub manifest: Manifest,
    /// Hash of the manifest being replaced. Absent on first configuration.
    #[serde(default)]
    pub previous_manifest_hash: Option<HexString>,
    #[serde(default)]
    pub authorization: Option<UpdateAuthorization>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetManifestResponse {
    pub manifest_hash: HexString,
    pub generation: u64,
    pub root_ca: String,
    pub mesh_ca: String,
    /// Only returned by the first configuration.
    #[serde(default)]
    pub seed_shares: Option<SeedShareDocument>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecoverRequest {
    /// Transport key the seed was sealed to.
    pub transport_key: HexString,
    pub sealed_seed: HexString,
    /// Seed-share owner's signature over the transport key and sealed seed.
    pub signature: HexString,
}

/// Plaintext of `RecoverRequest::sealed_seed`.
#[derive(Serialize, Deserialize)]
pub struct RecoverySecret {
    pub seed: HexString,
    pub salt: HexString,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecoverResponse {
    pub phase: String,
    pub manifest_hash: HexString,
    pub generation: u64,
}

/// Error body for every non-2xx response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
}

impl From<&ContrastError> for ErrorResponse {
    fn from(err: &ContrastError) -> Self {
        let detail = match err {
            ContrastError::Verification(v) => v.detail(),
            _ => None,
        };
        Self {
            error: err.to_redacted_string(),
            code: err.code(),
            kind: err.kind().to_string(),
            field: detail.map(|(f, _, _)| f.to_string()),
            expected: detail.map(|(_, e, _)| e.to_string()),
            observed: detail.map(|(_, _, o)| o.to_string()),
        }
    }
}
