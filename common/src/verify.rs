//! Composable attestation verifiers.
//!
//! Each verifier checks one aspect of a report. `Composed` runs them in order
//! and stops at the first failure, so callers decide the order: hardware
//! first, then manifest policy, then freshness.

use std::sync::Arc;

use thiserror::Error;

use crate::evidence::Evidence;
use crate::manifest::{HexString, Manifest, SnpReferenceValues};
use crate::report::{SnpReport, REPORT_DATA_SIZE, SIG_ALGO_ECDSA_P384_SHA384};
use crate::vendor::{verify_chain, verify_report_signature};

/// Why a report was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("malformed evidence: {reason}")]
    MalformedEvidence { reason: String },

    #[error("untrusted certificate chain: {reason}")]
    UntrustedChain { reason: String },

    #[error("invalid signature: {reason}")]
    BadSignature { reason: String },

    #[error("reference value mismatch on {field}: expected {expected}, observed {observed}")]
    ReferenceMismatch {
        field: String,
        expected: String,
        observed: String,
    },

    #[error("unknown policy digest {digest}")]
    UnknownPolicyDigest { digest: String },

    #[error("unexpected policy digest: expected {expected}, observed {observed}")]
    UnexpectedPolicyDigest { expected: String, observed: String },

    #[error("stale or replayed challenge: {reason}")]
    StaleNonce { reason: String },

    #[error("report data does not bind the presented nonce and keys")]
    ReportDataMismatch,
}

impl VerificationError {
    pub fn code(&self) -> u16 {
        match self {
            VerificationError::MalformedEvidence { .. } => 1100,
            VerificationError::UntrustedChain { .. } => 1101,
            VerificationError::BadSignature { .. } => 1102,
            VerificationError::ReferenceMismatch { .. } => 1103,
            VerificationError::UnknownPolicyDigest { .. } => 1104,
            VerificationError::UnexpectedPolicyDigest { .. } => 1105,
            VerificationError::StaleNonce { .. } => 1106,
            VerificationError::ReportDataMismatch => 1107,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            VerificationError::MalformedEvidence { .. } => "malformed_evidence",
            VerificationError::UntrustedChain { .. } => "untrusted_chain",
            VerificationError::BadSignature { .. } => "bad_signature",
            VerificationError::ReferenceMismatch { .. } => "reference_mismatch",
            VerificationError::UnknownPolicyDigest { .. } => "unknown_policy_digest",
            VerificationError::UnexpectedPolicyDigest { .. } => "unexpected_policy_digest",
            VerificationError::StaleNonce { .. } => "stale_nonce",
            VerificationError::ReportDataMismatch => "report_data_mismatch",
        }
    }

    /// Only freshness failures may be retried, and only with a new challenge.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VerificationError::StaleNonce { .. })
    }

    /// `(field, expected, observed)` for mismatches an operator can act on.
    pub fn detail(&self) -> Option<(&str, &str, &str)> {
        match self {
            VerificationError::ReferenceMismatch {
                field,
                expected,
                observed,
            } => Some((field, expected, observed)),
            VerificationError::UnexpectedPolicyDigest { expected, observed } => {
                Some(("host_data", expected, observed))
            }
            _ => None,
        }
    }
}

type VResult = std::result::Result<(), VerificationError>;

/// One verification capability.
pub trait Verifier: Send + Sync {
    fn verify(&self, evidence: &Evidence, report: &SnpReport) -> VResult;
}

/// Parse the report in `evidence` and run `verifier` on it.
pub fn verify_evidence(
    evidence: &Evidence,
    verifier: &dyn Verifier,
) -> std::result::Result<SnpReport, VerificationError> {
    let report = evidence
        .parse_report()
        .map_err(|e| VerificationError::MalformedEvidence {
            reason: e.to_string(),
        })?;
    verifier.verify(evidence, &report)?;
    Ok(report)
}

/// Runs verifiers in insertion order.
#[derive(Default)]
pub struct Composed {
    verifiers: Vec<Box<dyn Verifier>>,
}

impl Composed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifiers.push(Box::new(verifier));
        self
    }
}

impl Verifier for Composed {
    fn verify(&self, evidence: &Evidence, report: &SnpReport) -> VResult {
        for v in &self.verifiers {
            v.verify(evidence, report)?;
        }
        Ok(())
    }
}

/// Vendor chain, report signature and hardware reference values.
///
/// Only reference-value entries whose pinned root matches the chain's root
/// are considered. The report passes if any of them is satisfied; otherwise
/// the mismatch of the first candidate is returned.
pub struct HardwareReportVerifier {
    reference_values: Vec<SnpReferenceValues>,
}

impl HardwareReportVerifier {
    pub fn new(reference_values: Vec<SnpReferenceValues>) -> Self {
        Self { reference_values }
    }

    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self::new(manifest.reference_values.snp.clone())
    }
}

fn check_reference_values(report: &SnpReport, rv: &SnpReferenceValues) -> VResult {
    let observed = HexString::from_bytes(&report.measurement);
    if observed != rv.trusted_measurement {
        return Err(VerificationError::ReferenceMismatch {
            field: "measurement".to_string(),
            expected: rv.trusted_measurement.to_string(),
            observed: observed.to_string(),
        });
    }
    if let Some((field, min, seen)) = rv.minimum_tcb.first_violation(&report.reported_tcb) {
        return Err(VerificationError::ReferenceMismatch {
            field: format!("reported_tcb.{}", field),
            expected: format!(">= {}", min),
            observed: seen.to_string(),
        });
    }
    if report.vmpl != 0 {
        return Err(VerificationError::ReferenceMismatch {
            field: "vmpl".to_string(),
            expected: "0".to_string(),
            observed: report.vmpl.to_string(),
        });
    }
    if report.debug_allowed() {
        return Err(VerificationError::ReferenceMismatch {
            field: "policy.debug".to_string(),
            expected: "false".to_string(),
            observed: "true".to_string(),
        });
    }
    Ok(())
}

impl Verifier for HardwareReportVerifier {
    fn verify(&self, evidence: &Evidence, report: &SnpReport) -> VResult {
        if report.signature_algo != SIG_ALGO_ECDSA_P384_SHA384 {
            return Err(VerificationError::MalformedEvidence {
                reason: format!("unsupported signature algorithm {}", report.signature_algo),
            });
        }
        let chain = verify_chain(&evidence.vendor_chain, &report.chip_id)?;
        verify_report_signature(report, &chain.vcek_public_key)?;

        let root = HexString::from_bytes(&chain.root_key_digest);
        let candidates: Vec<&SnpReferenceValues> = self
            .reference_values
            .iter()
            .filter(|rv| rv.trusted_root_key_digest == root)
            .collect();
        let (first, rest) =
            candidates
                .split_first()
                .ok_or_else(|| VerificationError::UntrustedChain {
                    reason: format!("vendor root key {} is not trusted", root),
                })?;

        let first_result = check_reference_values(report, first);
        if first_result.is_ok()
            || rest
                .iter()
                .any(|rv| check_reference_values(report, rv).is_ok())
        {
            return Ok(());
        }
        first_result
    }
}

/// Host data must be a policy the manifest permits.
pub struct ManifestPolicyVerifier {
    manifest: Arc<Manifest>,
}

impl ManifestPolicyVerifier {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self { manifest }
    }
}

impl Verifier for ManifestPolicyVerifier {
    fn verify(&self, _evidence: &Evidence, report: &SnpReport) -> VResult {
        match self.manifest.policy_for(&report.host_data) {
            Some(_) => Ok(()),
            None => Err(VerificationError::UnknownPolicyDigest {
                digest: hex::encode(report.host_data),
            }),
        }
    }
}

/// Host data must equal one specific policy digest.
pub struct ExpectedPolicyVerifier {
    expected: HexString,
}

impl ExpectedPolicyVerifier {
    pub fn new(expected: HexString) -> Self {
        Self { expected }
    }
}

impl Verifier for ExpectedPolicyVerifier {
    fn verify(&self, _evidence: &Evidence, report: &SnpReport) -> VResult {
        let observed = HexString::from_bytes(&report.host_data);
        if observed == self.expected {
            Ok(())
        } else {
            Err(VerificationError::UnexpectedPolicyDigest {
                expected: self.expected.to_string(),
                observed: observed.to_string(),
            })
        }
    }
}

/// Report data must equal a precomputed binding.
pub struct ReportDataVerifier {
    expected: [u8; REPORT_DATA_SIZE],
}

impl ReportDataVerifier {
    pub fn new(expected: [u8; REPORT_DATA_SIZE]) -> Self {
        Self { expected }
    }
}

impl Verifier for ReportDataVerifier {
    fn verify(&self, _evidence: &Evidence, report: &SnpReport) -> VResult {
        if report.report_data == self.expected {
            Ok(())
        } else {
            Err(VerificationError::ReportDataMismatch)
        }
    }
}
