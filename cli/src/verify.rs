//! Relying-party verification of a Coordinator.
//!
//! `check_attestation` is pure: it takes the Coordinator's attestation, the
//! nonce it was requested with and the manifest the operator expects, and
//! runs every check. The async functions fetch what it needs.

use std::path::Path;

use contrast_common::api::{CoordinatorAttestation, ManifestsResponse};
use contrast_common::{
    generate_nonce, verify_evidence, ExpectedPolicyVerifier, HardwareReportVerifier, HexString,
    Manifest, ReportDataVerifier, VerificationError, Verifier,
};
use serde::{Deserialize, Serialize};

use crate::client::CoordinatorClient;
use crate::error::{CliError, Result};

/// Individual check outcome.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skip,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Fail => write!(f, "FAIL"),
            CheckStatus::Skip => write!(f, "SKIP"),
        }
    }
}

/// Checks in the order they run, with their display labels.
pub const CHECKS: [(&str, &str); 7] = [
    ("vendor_chain", "Vendor certificate chain"),
    ("report_signature", "Report signature"),
    ("reference_values", "Reference values"),
    ("coordinator_policy", "Coordinator policy"),
    ("report_data", "Report data binding"),
    ("phase", "Coordinator phase"),
    ("manifest", "Active manifest"),
];

/// Also run by `verify_coordinator`, after the history is fetched.
pub const HISTORY_CHECK: (&str, &str) = ("history", "Manifest history");

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VerifyReport {
    pub verified: bool,
    pub coordinator: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
    pub transport_key: String,
    pub checks: Vec<Check>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn status(&self, name: &str) -> CheckStatus {
        self.checks
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
            .unwrap_or(CheckStatus::Skip)
    }

    fn record(&mut self, name: &str, status: CheckStatus, detail: Option<String>) {
        if status == CheckStatus::Fail {
            if let Some(d) = &detail {
                self.errors.push(format!("{}: {}", name, d));
            }
        }
        let check = Check {
            name: name.to_string(),
            status,
            detail,
        };
        match self.checks.iter_mut().find(|c| c.name == name) {
            Some(existing) => *existing = check,
            None => self.checks.push(check),
        }
        self.verified = !self.checks.iter().any(|c| c.status == CheckStatus::Fail);
    }
}

/// What the caller intends to do with the Coordinator, which decides the
/// phase it must be in and whether its active manifest is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Trust the running deployment: the active manifest must be the expected one.
    Verify,
    /// Set or update the manifest to the expected one.
    SetManifest,
    /// Hand the seed back after a restart.
    Recover,
}

fn describe(err: &VerificationError) -> String {
    match err.detail() {
        Some((field, expected, observed)) => {
            format!("{}: expected {}, observed {}", field, expected, observed)
        }
        None => err.to_string(),
    }
}

/// Run every check on an attestation requested with `nonce`.
pub fn check_attestation(
    attestation: &CoordinatorAttestation,
    nonce: &[u8],
    expected: &Manifest,
    purpose: Purpose,
    coordinator: &str,
) -> VerifyReport {
    let mut report = VerifyReport {
        verified: false,
        coordinator: coordinator.to_string(),
        phase: attestation.phase.clone(),
        manifest_hash: attestation.manifest_hash.as_ref().map(|h| h.to_string()),
        transport_key: attestation.transport_key.to_string(),
        checks: Vec::new(),
        errors: Vec::new(),
    };
    let untrusted = || Some("evidence is not trusted".to_string());

    // 1-3. Vendor chain, report signature, reference values.
    let hardware = HardwareReportVerifier::from_manifest(expected);
    let snp = match verify_evidence(&attestation.evidence, &hardware) {
        Ok(snp) => {
            report.record("vendor_chain", CheckStatus::Pass, None);
            report.record("report_signature", CheckStatus::Pass, None);
            report.record("reference_values", CheckStatus::Pass, None);
            Some(snp)
        }
        Err(e) => {
            let failed = match e {
                VerificationError::MalformedEvidence { .. }
                | VerificationError::UntrustedChain { .. } => 0,
                VerificationError::BadSignature { .. } => 1,
                _ => 2,
            };
            for (i, (name, _)) in CHECKS.iter().take(3).enumerate() {
                if i < failed {
                    report.record(name, CheckStatus::Pass, None);
                } else if i == failed {
                    report.record(name, CheckStatus::Fail, Some(describe(&e)));
                } else {
                    report.record(name, CheckStatus::Skip, untrusted());
                }
            }
            None
        }
    };

    // 4-5. Coordinator policy and report data.
    match &snp {
        Some(snp) => {
            match expected.coordinator_policy() {
                Ok((digest, _)) => {
                    match ExpectedPolicyVerifier::new(digest.clone())
                        .verify(&attestation.evidence, snp)
                    {
                        Ok(()) => report.record("coordinator_policy", CheckStatus::Pass, None),
                        Err(e) => report.record(
                            "coordinator_policy",
                            CheckStatus::Fail,
                            Some(describe(&e)),
                        ),
                    }
                }
                Err(e) => {
                    report.record("coordinator_policy", CheckStatus::Fail, Some(e.to_string()))
                }
            }
            let binding = ReportDataVerifier::new(attestation.expected_report_data(nonce));
            match binding.verify(&attestation.evidence, snp) {
                Ok(()) => report.record("report_data", CheckStatus::Pass, None),
                Err(e) => report.record("report_data", CheckStatus::Fail, Some(describe(&e))),
            }
        }
        None => {
            report.record("coordinator_policy", CheckStatus::Skip, untrusted());
            report.record("report_data", CheckStatus::Skip, untrusted());
        }
    }

    // 6. Phase.
    let phase = attestation.phase.as_str();
    let phase_ok = match purpose {
        Purpose::Verify => matches!(phase, "configured" | "serving"),
        Purpose::SetManifest => matches!(phase, "uninitialized" | "configured" | "serving"),
        Purpose::Recover => phase == "unrecovered",
    };
    if phase_ok {
        report.record("phase", CheckStatus::Pass, None);
    } else {
        report.record(
            "phase",
            CheckStatus::Fail,
            Some(format!("Coordinator is {}", phase)),
        );
    }

    // 7. Active manifest.
    if purpose == Purpose::Verify {
        match expected.hash() {
            Ok(hash) => {
                let expected_hash = HexString::from_bytes(&hash);
                match &attestation.manifest_hash {
                    Some(active) if *active == expected_hash => {
                        report.record("manifest", CheckStatus::Pass, None)
                    }
                    Some(active) => report.record(
                        "manifest",
                        CheckStatus::Fail,
                        Some(format!(
                            "active manifest {} differs from expected {}",
                            active, expected_hash
                        )),
                    ),
                    None => report.record(
                        "manifest",
                        CheckStatus::Fail,
                        Some("Coordinator has no active manifest".to_string()),
                    ),
                }
            }
            Err(e) => report.record("manifest", CheckStatus::Fail, Some(e.to_string())),
        }
    } else {
        report.record("manifest", CheckStatus::Skip, None);
    }

    report
}

/// The history must end in the attested manifest and carry the attested CAs.
pub fn check_history(
    report: &mut VerifyReport,
    attestation: &CoordinatorAttestation,
    history: &ManifestsResponse,
) {
    let name = HISTORY_CHECK.0;
    let last = match history.manifests.last().map(Manifest::hash) {
        Some(Ok(hash)) => HexString::from_bytes(&hash),
        Some(Err(e)) => {
            report.record(name, CheckStatus::Fail, Some(e.to_string()));
            return;
        }
        None => {
            report.record(name, CheckStatus::Fail, Some("history is empty".to_string()));
            return;
        }
    };
    if attestation.manifest_hash.as_ref() != Some(&last) {
        report.record(
            name,
            CheckStatus::Fail,
            Some(format!("latest manifest {} is not the attested one", last)),
        );
    } else if attestation.root_ca.as_deref() != Some(history.root_ca.as_str())
        || attestation.mesh_ca.as_deref() != Some(history.mesh_ca.as_str())
    {
        report.record(
            name,
            CheckStatus::Fail,
            Some("CA certificates differ from the attested ones".to_string()),
        );
    } else {
        report.record(name, CheckStatus::Pass, None);
    }
}

/// An attestation that passed every check for its purpose.
pub struct AttestedCoordinator {
    pub attestation: CoordinatorAttestation,
    pub report: VerifyReport,
}

impl AttestedCoordinator {
    pub fn transport_key(&self) -> Vec<u8> {
        self.attestation.transport_key.to_bytes()
    }
}

/// Request the Coordinator's attestation with a fresh nonce and check it.
pub async fn attest_coordinator(
    client: &CoordinatorClient,
    expected: &Manifest,
    purpose: Purpose,
) -> Result<AttestedCoordinator> {
    let nonce = generate_nonce();
    let attestation = client.attestation(&nonce).await?;
    let report = check_attestation(&attestation, &nonce, expected, purpose, client.base_url());
    if !report.verified {
        tracing::warn!(
            event = "coordinator_untrusted",
            coordinator = %client.base_url(),
            errors = report.errors.len()
        );
        return Err(CliError::Untrusted(Box::new(report)));
    }
    tracing::info!(
        event = "coordinator_attested",
        coordinator = %client.base_url(),
        phase = %report.phase
    );
    Ok(AttestedCoordinator {
        attestation,
        report,
    })
}

/// A Coordinator verified to run `expected`, with its history.
pub struct VerifiedCoordinator {
    pub report: VerifyReport,
    pub history: ManifestsResponse,
}

/// Attest the Coordinator, require `expected` to be its active manifest and
/// fetch the manifest history it attests to.
pub async fn verify_coordinator(
    client: &CoordinatorClient,
    expected: &Manifest,
) -> Result<VerifiedCoordinator> {
    let attested = attest_coordinator(client, expected, Purpose::Verify).await?;
    let history = client.manifests().await?;
    let mut report = attested.report;
    check_history(&mut report, &attested.attestation, &history);
    if !report.verified {
        return Err(CliError::Untrusted(Box::new(report)));
    }
    Ok(VerifiedCoordinator { report, history })
}

/// Write the verified CA certificates and manifest history into `dir`.
pub fn write_verified(dir: &Path, history: &ManifestsResponse) -> Result<()> {
    let manifests_dir = dir.join("manifests");
    std::fs::create_dir_all(&manifests_dir).map_err(|e| CliError::io(&manifests_dir, e))?;
    let write = |path: std::path::PathBuf, contents: &[u8]| {
        std::fs::write(&path, contents).map_err(|e| CliError::io(path, e))
    };
    write(dir.join("coordinator-root-ca.pem"), history.root_ca.as_bytes())?;
    write(dir.join("mesh-ca.pem"), history.mesh_ca.as_bytes())?;
    for (i, manifest) in history.manifests.iter().enumerate() {
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| CliError::parse(&manifests_dir, e))?;
        write(manifests_dir.join(format!("manifest.{}.json", i)), &json)?;
    }
    Ok(())
}

/// Explanation for a failed check.
pub struct CheckExplanation {
    pub why: &'static str,
    pub fix: &'static str,
}

/// Only `Fail` gets an explanation.
pub fn explain_check(name: &str, status: CheckStatus) -> Option<CheckExplanation> {
    if status != CheckStatus::Fail {
        return None;
    }
    let explanation = match name {
        "vendor_chain" => CheckExplanation {
            why: "The VCEK is not certified by a vendor root trusted in the manifest reference values.",
            fix: "Check trusted_root_key_digest and that the Coordinator runs on the expected platform.",
        },
        "report_signature" => CheckExplanation {
            why: "The attestation report is not signed by the VCEK it came with.",
            fix: "The report was modified in transit. Do not trust this Coordinator.",
        },
        "reference_values" => CheckExplanation {
            why: "Launch measurement, TCB, VMPL or guest policy differ from the reference values.",
            fix: "Compare the field named above with the reference values used to generate the manifest.",
        },
        "coordinator_policy" => CheckExplanation {
            why: "The Coordinator VM was launched with a different policy than the manifest names.",
            fix: "Regenerate the manifest against the deployed Coordinator descriptor.",
        },
        "report_data" => CheckExplanation {
            why: "The report does not bind this request's nonce and the Coordinator's keys and CAs.",
            fix: "The response was replayed or altered. Retry; if it persists, do not trust this Coordinator.",
        },
        "phase" => CheckExplanation {
            why: "The Coordinator is not in a phase that allows this operation.",
            fix: "Run `contrast set` on a new Coordinator or `contrast recover` after a restart.",
        },
        "manifest" => CheckExplanation {
            why: "The Coordinator enforces a different manifest than the one given.",
            fix: "Verify against the manifest that was last set, or set this one.",
        },
        "history" => CheckExplanation {
            why: "The manifest history or CA certificates served do not match the attested state.",
            fix: "A manifest update may have raced this verification. Retry.",
        },
        _ => return None,
    };
    Some(explanation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contrast_common::api::coordinator_report_data;
    use contrast_common::testing::{policy_bytes, TestDeployment};
    use contrast_common::ReportIssuer;

    fn attestation(
        deploy: &TestDeployment,
        nonce: &[u8],
        phase: &str,
        manifest_hash: Option<[u8; 32]>,
    ) -> CoordinatorAttestation {
        let transport_key = [5u8; 32];
        let report_data = coordinator_report_data(
            nonce,
            &transport_key,
            Some("root"),
            Some("mesh"),
            manifest_hash.as_ref().map(|h| h.as_slice()),
        );
        CoordinatorAttestation {
            evidence: deploy.coordinator_issuer().issue(&report_data).unwrap(),
            transport_key: HexString::from_bytes(&transport_key),
            phase: phase.to_string(),
            root_ca: Some("root".to_string()),
            mesh_ca: Some("mesh".to_string()),
            manifest_hash: manifest_hash.map(|h| HexString::from_bytes(&h)),
        }
    }

    fn setup() -> (TestDeployment, Manifest) {
        let deploy = TestDeployment::new(b"cli-verify-test");
        let manifest = deploy.manifest(&[(&policy_bytes("web", 0xAB), "web")]);
        (deploy, manifest)
    }

    #[test]
    fn test_matching_coordinator_passes() {
        let (deploy, manifest) = setup();
        let nonce = [1u8; 32];
        let att = attestation(&deploy, &nonce, "serving", Some(manifest.hash().unwrap()));
        let report = check_attestation(&att, &nonce, &manifest, Purpose::Verify, "test");
        assert!(report.verified, "{:?}", report.errors);
        for (name, _) in CHECKS {
            assert_eq!(report.status(name), CheckStatus::Pass, "{}", name);
        }
    }

    #[test]
    fn test_other_nonce_fails_binding() {
        let (deploy, manifest) = setup();
        let att = attestation(&deploy, &[1u8; 32], "serving", Some(manifest.hash().unwrap()));
        let report = check_attestation(&att, &[2u8; 32], &manifest, Purpose::Verify, "test");
        assert!(!report.verified);
        assert_eq!(report.status("report_data"), CheckStatus::Fail);
        assert_eq!(report.status("vendor_chain"), CheckStatus::Pass);
    }

    #[test]
    fn test_different_manifest_fails() {
        let (deploy, manifest) = setup();
        let other = deploy.manifest(&[(&policy_bytes("db", 0xDB), "db")]);
        let nonce = [1u8; 32];
        let att = attestation(&deploy, &nonce, "serving", Some(other.hash().unwrap()));
        let report = check_attestation(&att, &nonce, &manifest, Purpose::Verify, "test");
        assert!(!report.verified);
        assert_eq!(report.status("manifest"), CheckStatus::Fail);
        // Same Coordinator identity.
        assert_eq!(report.status("coordinator_policy"), CheckStatus::Pass);
    }

    #[test]
    fn test_untrusted_root_skips_dependent_checks() {
        let (deploy, _) = setup();
        let rogue = TestDeployment::new(b"rogue-vendor");
        let manifest = rogue.manifest(&[]);
        let nonce = [1u8; 32];
        let att = attestation(&deploy, &nonce, "serving", Some(manifest.hash().unwrap()));
        let report = check_attestation(&att, &nonce, &manifest, Purpose::Verify, "test");
        assert_eq!(report.status("vendor_chain"), CheckStatus::Fail);
        assert_eq!(report.status("report_signature"), CheckStatus::Skip);
        assert_eq!(report.status("coordinator_policy"), CheckStatus::Skip);
        assert_eq!(report.status("report_data"), CheckStatus::Skip);
        assert!(explain_check("vendor_chain", CheckStatus::Fail).is_some());
    }

    #[test]
    fn test_phase_depends_on_purpose() {
        let (deploy, manifest) = setup();
        let nonce = [1u8; 32];
        let att = attestation(&deploy, &nonce, "unrecovered", None);

        let verify = check_attestation(&att, &nonce, &manifest, Purpose::Verify, "test");
        assert_eq!(verify.status("phase"), CheckStatus::Fail);

        let recover = check_attestation(&att, &nonce, &manifest, Purpose::Recover, "test");
        assert!(recover.verified, "{:?}", recover.errors);
        assert_eq!(recover.status("manifest"), CheckStatus::Skip);

        let set = check_attestation(&att, &nonce, &manifest, Purpose::SetManifest, "test");
        assert_eq!(set.status("phase"), CheckStatus::Fail);
    }

    #[test]
    fn test_history_must_end_in_attested_manifest() {
        let (deploy, manifest) = setup();
        let nonce = [1u8; 32];
        let att = attestation(&deploy, &nonce, "serving", Some(manifest.hash().unwrap()));
        let mut report = check_attestation(&att, &nonce, &manifest, Purpose::Verify, "test");

        let good = ManifestsResponse {
            manifests: vec![manifest.clone()],
            root_ca: "root".to_string(),
            mesh_ca: "mesh".to_string(),
            generation: 1,
        };
        check_history(&mut report, &att, &good);
        assert_eq!(report.status("history"), CheckStatus::Pass);
        assert!(report.verified);

        let swapped = ManifestsResponse {
            mesh_ca: "other".to_string(),
            ..good
        };
        check_history(&mut report, &att, &swapped);
        assert_eq!(report.status("history"), CheckStatus::Fail);
        assert!(!report.verified);
    }

    #[test]
    fn test_pass_and_skip_have_no_explanation() {
        assert!(explain_check("vendor_chain", CheckStatus::Pass).is_none());
        assert!(explain_check("manifest", CheckStatus::Skip).is_none());
        assert!(explain_check("nonexistent", CheckStatus::Fail).is_none());
        for (name, _) in CHECKS.iter().chain([HISTORY_CHECK].iter()) {
            assert!(explain_check(name, CheckStatus::Fail).is_some(), "{}", name);
        }
    }
}
