//! Coordinator core: attestation, manifest updates and recovery.
//!
//! The HTTP layer is a thin wrapper around `Coordinator`; tests drive it
//! directly as well as through the router.

use std::sync::Arc;
use std::time::Duration;

use contrast_common::api::{
    coordinator_report_data, AttestRequest, AttestResponse, CoordinatorAttestation,
    ManifestsResponse, RecoverRequest, RecoverResponse, RecoverySecret, SetManifestRequest,
    SetManifestResponse,
};
use contrast_common::evidence::workload_report_data;
use contrast_common::history::{History, LatestTransition, Transition};
use contrast_common::seed::SeedEngine;
use contrast_common::seedshare::{verify_recovery, SeedShareDocument};
use contrast_common::transport::{TransportKeyPair, RECOVERY_INFO};
use contrast_common::{
    verify_evidence, AuditEventType, AuditLogEntry, AuditSeverity, Composed, ContrastError,
    HardwareReportVerifier, HexString, Manifest, ManifestPolicyVerifier, ReportDataVerifier,
    ReportIssuer, Result, Verifier, NONCE_SIZE,
};
use ed25519_dalek::VerifyingKey;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::audit::AuditLog;
use crate::freshness::{NonceManager, MAX_OUTSTANDING_NONCES, NONCE_VALIDITY};
use crate::state::{ActiveState, Phase};

/// Default deadline for verifying one workload's evidence.
pub const VERIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub verification_timeout: Duration,
    pub nonce_validity: Duration,
    pub max_outstanding_nonces: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            verification_timeout: VERIFICATION_TIMEOUT,
            nonce_validity: NONCE_VALIDITY,
            max_outstanding_nonces: MAX_OUTSTANDING_NONCES,
        }
    }
}

pub struct Coordinator {
    phase: RwLock<Phase>,
    /// Serializes manifest updates and recovery.
    update_lock: Mutex<()>,
    history: Arc<History>,
    issuer: Arc<dyn ReportIssuer>,
    transport: TransportKeyPair,
    nonces: NonceManager,
    audit: AuditLog,
    config: CoordinatorConfig,
}

fn fixed<const N: usize>(name: &str, value: &HexString) -> Result<[u8; N]> {
    value
        .to_bytes()
        .try_into()
        .map_err(|_| ContrastError::InvalidInput(format!("{} must be {} bytes", name, N)))
}

impl Coordinator {
    /// Starts `Unrecovered` when `history` already holds a manifest.
    pub fn new(
        history: History,
        issuer: Arc<dyn ReportIssuer>,
        audit: AuditLog,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let phase = if history.has_latest()? {
            Phase::Unrecovered
        } else {
            Phase::Uninitialized
        };
        info!(event = "coordinator_start", phase = phase.name());
        Ok(Self {
            phase: RwLock::new(phase),
            update_lock: Mutex::new(()),
            history: Arc::new(history),
            issuer,
            transport: TransportKeyPair::generate(),
            nonces: NonceManager::new(config.nonce_validity, config.max_outstanding_nonces),
            audit,
            config,
        })
    }

    pub async fn phase(&self) -> Phase {
        self.phase.read().await.clone()
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn transport_key(&self) -> [u8; 32] {
        self.transport.public_key()
    }

    pub async fn issue_nonce(&self) -> Result<[u8; NONCE_SIZE]> {
        self.nonces.issue().await
    }

    /// Verify a workload's evidence and issue its certificate bundle.
    pub async fn attest(&self, request: AttestRequest) -> Result<AttestResponse> {
        let active = self.phase.read().await.active()?.clone();
        let nonce = request.nonce.to_bytes();
        let public_key_bytes: [u8; 32] = fixed("public_key", &request.public_key)?;
        let public_key = VerifyingKey::from_bytes(&public_key_bytes)
            .map_err(|e| ContrastError::InvalidInput(format!("invalid public key: {}", e)))?;
        let secret_key: [u8; 32] = fixed("secret_key", &request.secret_key)?;

        // Consumed on presentation; the outcome is checked after the hardware
        // and policy checks so failures are reported in a fixed order.
        let freshness = self.nonces.consume(&nonce).await;

        let expected_report_data = workload_report_data(&nonce, &public_key_bytes, &secret_key);
        let manifest = active.manifest.clone();
        let evidence = request.evidence;
        let verification = tokio::task::spawn_blocking(move || {
            let verifier = Composed::new()
                .with(HardwareReportVerifier::from_manifest(&manifest))
                .with(ManifestPolicyVerifier::new(manifest.clone()));
            let report = verify_evidence(&evidence, &verifier)?;
            freshness?;
            ReportDataVerifier::new(expected_report_data).verify(&evidence, &report)?;
            Ok::<_, ContrastError>(report)
        });

        let outcome = match tokio::time::timeout(self.config.verification_timeout, verification)
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ContrastError::Internal(format!(
                "verification task failed: {}",
                e
            ))),
            Err(_) => Err(ContrastError::Timeout(format!(
                "verification exceeded {:?}",
                self.config.verification_timeout
            ))),
        };

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    event = "attestation_rejected",
                    code = e.code(),
                    kind = e.kind(),
                    error = %e.to_redacted_string()
                );
                self.audit
                    .record(
                        AuditLogEntry::new(
                            AuditEventType::AttestationRejected,
                            AuditSeverity::Warning,
                        )
                        .with_manifest_hash(&active.manifest_hash)
                        .with_detail("code", e.code())
                        .with_detail("kind", e.kind()),
                    )
                    .await;
                return Err(e);
            }
        };

        let response = active.issue(&report, &public_key, &secret_key)?;
        let digest = hex::encode(report.host_data);
        info!(
            event = "certificate_issued",
            policy_digest = %digest,
            generation = response.generation
        );
        self.audit
            .record(
                AuditLogEntry::new(AuditEventType::CertificateIssued, AuditSeverity::Info)
                    .with_policy_digest(digest)
                    .with_manifest_hash(&active.manifest_hash)
                    .with_detail("generation", response.generation),
            )
            .await;

        let mut phase = self.phase.write().await;
        if let Phase::Configured(current) = &*phase {
            if Arc::ptr_eq(current, &active) {
                *phase = Phase::Serving(active.clone());
                info!(event = "phase_change", phase = "serving");
            }
        }
        Ok(response)
    }

    /// The Coordinator's own evidence, bound to a caller-chosen nonce.
    pub async fn attestation(&self, nonce: &[u8]) -> Result<CoordinatorAttestation> {
        if nonce.len() != NONCE_SIZE {
            return Err(ContrastError::InvalidInput(format!(
                "nonce must be {} bytes",
                NONCE_SIZE
            )));
        }
        let phase = self.phase().await;
        let active = phase.active().ok();
        let transport_key = self.transport.public_key();
        let root_ca = active.map(|a| a.ca.root_ca_pem().to_string());
        let mesh_ca = active.map(|a| a.ca.mesh_ca_pem().to_string());
        let manifest_hash = active.map(|a| a.manifest_hash);
        let report_data = coordinator_report_data(
            nonce,
            &transport_key,
            root_ca.as_deref(),
            mesh_ca.as_deref(),
            manifest_hash.as_ref().map(|h| h.as_slice()),
        );

        let issuer = self.issuer.clone();
        let evidence = tokio::task::spawn_blocking(move || issuer.issue(&report_data))
            .await
            .map_err(|e| ContrastError::Internal(format!("report task failed: {}", e)))??;
        Ok(CoordinatorAttestation {
            evidence,
            transport_key: HexString::from_bytes(&transport_key),
            phase: phase.name().to_string(),
            root_ca,
            mesh_ca,
            manifest_hash: manifest_hash.map(|h| HexString::from_bytes(&h)),
        })
    }

    pub async fn manifests(&self) -> Result<ManifestsResponse> {
        let active = self.phase.read().await.active()?.clone();
        let manifests = self
            .history
            .manifests(&active.latest.transition_hash)?
            .iter()
            .map(|bytes| Manifest::from_json(bytes))
            .collect::<Result<Vec<_>>>()?;
        Ok(ManifestsResponse {
            manifests,
            root_ca: active.ca.root_ca_pem().to_string(),
            mesh_ca: active.ca.mesh_ca_pem().to_string(),
            generation: active.generation(),
        })
    }

    pub async fn set_manifest(&self, request: SetManifestRequest) -> Result<SetManifestResponse> {
        let result = self.set_manifest_locked(request).await;
        if let Err(e) = &result {
            warn!(event = "manifest_rejected", code = e.code(), kind = e.kind());
            self.audit
                .record(
                    AuditLogEntry::new(AuditEventType::ManifestRejected, AuditSeverity::Warning)
                        .with_detail("code", e.code())
                        .with_detail("kind", e.kind()),
                )
                .await;
        }
        result
    }

    async fn set_manifest_locked(
        &self,
        request: SetManifestRequest,
    ) -> Result<SetManifestResponse> {
        let manifest = request.manifest;
        manifest.validate()?;
        let manifest_bytes = manifest.canonical_bytes()?;

        let _guard = self.update_lock.lock().await;
        let phase = self.phase().await;

        let (state, previous, seed_shares) = match &phase {
            Phase::Unrecovered => return Err(ContrastError::NotRecovered),
            Phase::Uninitialized => {
                let engine = Arc::new(SeedEngine::generate());
                let seed_shares =
                    SeedShareDocument::encrypt(&engine, &manifest.seedshare_owner_keys()?)?;
                let latest = LatestTransition::sign(
                    Transition::after(None, &manifest_bytes).hash(),
                    &engine.history_signing_key()?,
                );
                let state = ActiveState::new(engine, manifest, latest, 1)?;
                (state, None, Some(seed_shares))
            }
            Phase::Configured(active) | Phase::Serving(active) => {
                let previous = request.previous_manifest_hash.ok_or_else(|| {
                    ContrastError::ManifestConflict(
                        "previous manifest hash is required for updates".to_string(),
                    )
                })?;
                let previous: [u8; 32] = fixed("previous_manifest_hash", &previous)?;
                if previous != active.manifest_hash {
                    return Err(ContrastError::ManifestConflict(format!(
                        "active manifest is {}",
                        hex::encode(active.manifest_hash)
                    )));
                }
                let authorization = request.authorization.ok_or_else(|| {
                    ContrastError::Unauthorized("manifest updates must be signed".to_string())
                })?;
                authorization.verify(&active.manifest, &previous, &manifest)?;
                if manifest.seedshare_owner_pub_keys != active.manifest.seedshare_owner_pub_keys {
                    return Err(ContrastError::InvalidManifest(
                        "seed share owners cannot change".to_string(),
                    ));
                }

                let engine = active.engine().clone();
                let latest = LatestTransition::sign(
                    Transition::after(Some(&active.latest), &manifest_bytes).hash(),
                    &engine.history_signing_key()?,
                );
                let state = ActiveState::new(engine, manifest, latest, active.generation() + 1)?;
                (state, Some(active.latest.clone()), None)
            }
        };

        // The new state, CA included, exists before the history moves, so a
        // failure up to here leaves both the store and the phase untouched.
        self.history.commit(previous.as_ref(), &manifest_bytes, &state.latest)?;

        let state = Arc::new(state);
        let response = SetManifestResponse {
            manifest_hash: HexString::from_bytes(&state.manifest_hash),
            generation: state.generation(),
            root_ca: state.ca.root_ca_pem().to_string(),
            mesh_ca: state.ca.mesh_ca_pem().to_string(),
            seed_shares,
        };
        let phase_name = self.install(state.clone()).await;
        info!(
            event = "manifest_set",
            manifest_hash = %response.manifest_hash,
            generation = response.generation,
            phase = phase_name
        );

        self.audit
            .record(
                AuditLogEntry::new(AuditEventType::ManifestSet, AuditSeverity::Info)
                    .with_manifest_hash(&state.manifest_hash)
                    .with_detail("generation", state.generation()),
            )
            .await;
        Ok(response)
    }

    /// Make `state` active. The variant is taken from the phase at write
    /// time, so a Configured to Serving move by a concurrent attestation is
    /// kept.
    async fn install(&self, state: Arc<ActiveState>) -> &'static str {
        let mut phase = self.phase.write().await;
        *phase = phase.with_state(state);
        phase.name()
    }

    /// Reload the seed after a restart.
    pub async fn recover(&self, request: RecoverRequest) -> Result<RecoverResponse> {
        let _guard = self.update_lock.lock().await;
        match &*self.phase.read().await {
            Phase::Unrecovered => {}
            Phase::Uninitialized => return Err(ContrastError::NoManifest),
            _ => {
                return Err(ContrastError::InvalidState(
                    "coordinator is already recovered".to_string(),
                ))
            }
        }

        match self.restore(&request) {
            Ok(state) => {
                let state = Arc::new(state);
                let response = RecoverResponse {
                    phase: "serving".to_string(),
                    manifest_hash: HexString::from_bytes(&state.manifest_hash),
                    generation: state.generation(),
                };
                *self.phase.write().await = Phase::Serving(state.clone());
                info!(
                    event = "phase_change",
                    phase = "serving",
                    generation = response.generation,
                    "recovered"
                );
                self.audit
                    .record(
                        AuditLogEntry::new(AuditEventType::RecoverySucceeded, AuditSeverity::Info)
                            .with_manifest_hash(&state.manifest_hash)
                            .with_detail("generation", state.generation()),
                    )
                    .await;
                Ok(response)
            }
            Err(e) => {
                warn!(event = "recovery_failed", code = e.code(), kind = e.kind());
                self.audit
                    .record(
                        AuditLogEntry::new(AuditEventType::RecoveryFailed, AuditSeverity::Error)
                            .with_detail("code", e.code())
                            .with_detail("kind", e.kind()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    fn restore(&self, request: &RecoverRequest) -> Result<ActiveState> {
        let transport_key = request.transport_key.to_bytes();
        if transport_key != self.transport.public_key() {
            return Err(ContrastError::Unauthorized(
                "recovery was sealed to a different transport key".to_string(),
            ));
        }
        let sealed = request.sealed_seed.to_bytes();

        // Owner keys come from unauthenticated storage here; the signed latest
        // pointer is checked below with the recovered seed.
        let unverified = self.history.get_latest_unverified()?;
        let transition = self.history.get_transition(&unverified.transition_hash)?;
        let stored = Manifest::from_json(&self.history.get_manifest(&transition.manifest_hash)?)?;
        verify_recovery(
            &stored.seedshare_owner_keys()?,
            &transport_key,
            &sealed,
            &request.signature.to_bytes(),
        )?;

        let plaintext = Zeroizing::new(
            self.transport
                .open(RECOVERY_INFO, &sealed)
                .map_err(|_| ContrastError::RecoveryFailed("cannot open sealed seed".to_string()))?,
        );
        let secret: RecoverySecret = serde_json::from_slice(&plaintext)
            .map_err(|_| ContrastError::RecoveryFailed("malformed recovery payload".to_string()))?;
        let seed = Zeroizing::new(secret.seed.to_bytes());
        let engine = Arc::new(SeedEngine::new(&seed, &secret.salt.to_bytes())?);

        let latest = self
            .history
            .get_latest(&engine.history_signing_key()?.verifying_key())?;
        let generation = self.history.walk(&latest.transition_hash)?.len() as u64;
        let head = self.history.get_transition(&latest.transition_hash)?;
        let manifest = Manifest::from_json(&self.history.get_manifest(&head.manifest_hash)?)?;
        ActiveState::new(engine, manifest, latest, generation)
    }
}
