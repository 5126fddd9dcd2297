//! Coordinator phases and the key material of an active manifest.

use std::sync::Arc;

use contrast_common::api::AttestResponse;
use contrast_common::ca::CertificateAuthority;
use contrast_common::history::LatestTransition;
use contrast_common::seed::SeedEngine;
use contrast_common::transport::{seal, WORKLOAD_SECRET_INFO};
use contrast_common::{ContrastError, HexString, Manifest, Result, SnpReport};
use ed25519_dalek::VerifyingKey;

/// Everything needed to serve one manifest generation. Immutable; a manifest
/// update builds a new one.
pub struct ActiveState {
    pub manifest: Arc<Manifest>,
    pub manifest_hash: [u8; 32],
    pub latest: LatestTransition,
    pub ca: CertificateAuthority,
    engine: Arc<SeedEngine>,
}

impl ActiveState {
    pub fn new(
        engine: Arc<SeedEngine>,
        manifest: Manifest,
        latest: LatestTransition,
        generation: u64,
    ) -> Result<Self> {
        let ca = CertificateAuthority::new(&engine, &latest.transition_hash, generation)?;
        Ok(Self {
            manifest_hash: manifest.hash()?,
            manifest: Arc::new(manifest),
            latest,
            ca,
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<SeedEngine> {
        &self.engine
    }

    pub fn generation(&self) -> u64 {
        self.ca.generation()
    }

    /// Certificate bundle for a report that already passed verification
    /// against this state's manifest.
    pub fn issue(
        &self,
        report: &SnpReport,
        public_key: &VerifyingKey,
        secret_key: &[u8],
    ) -> Result<AttestResponse> {
        let entry = self.manifest.policy_for(&report.host_data).ok_or_else(|| {
            ContrastError::Internal("issuing for a policy outside the manifest".to_string())
        })?;
        let certificate =
            self.ca
                .issue_workload_cert(public_key, &entry.sans, &report.host_data)?;
        let workload_secret = match &entry.workload_secret_id {
            Some(id) => {
                let secret = self.engine.workload_secret(id)?;
                Some(HexString::from_bytes(&seal(
                    secret_key,
                    WORKLOAD_SECRET_INFO,
                    secret.as_ref(),
                )?))
            }
            None => None,
        };
        Ok(AttestResponse {
            certificate,
            mesh_ca: self.ca.mesh_ca_pem().to_string(),
            root_ca: self.ca.root_ca_pem().to_string(),
            workload_secret,
            generation: self.generation(),
            manifest_hash: HexString::from_bytes(&self.manifest_hash),
        })
    }
}

/// Lifecycle of a Coordinator process.
///
/// Only `Configured` and `Serving` hold key material.
#[derive(Clone)]
pub enum Phase {
    /// No manifest has ever been set.
    Uninitialized,
    /// A manifest is set but no workload has been certified yet.
    Configured(Arc<ActiveState>),
    Serving(Arc<ActiveState>),
    /// History exists on disk but the seed is not loaded.
    Unrecovered,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Configured(_) => "configured",
            Phase::Serving(_) => "serving",
            Phase::Unrecovered => "unrecovered",
        }
    }

    pub fn active(&self) -> Result<&Arc<ActiveState>> {
        match self {
            Phase::Configured(state) | Phase::Serving(state) => Ok(state),
            Phase::Uninitialized => Err(ContrastError::NoManifest),
            Phase::Unrecovered => Err(ContrastError::NotRecovered),
        }
    }

    /// Same phase variant carrying `state`.
    pub fn with_state(&self, state: Arc<ActiveState>) -> Phase {
        match self {
            Phase::Serving(_) => Phase::Serving(state),
            _ => Phase::Configured(state),
        }
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
