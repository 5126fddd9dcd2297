//! Shared test utilities.
//!
//! Builds simulated deployments: a vendor hierarchy, policy documents, a
//! manifest permitting them and issuers that produce matching evidence.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::issuer::{LaunchParameters, SimulatedIssuer};
use crate::manifest::{
    HexString, Manifest, PolicyEntry, ProductName, ReferenceValues, Role, SnpReferenceValues,
    SnpTcb,
};
use crate::policy::{ContainerPolicy, PolicyDigest, PolicyDocument, PolicyRules};
use crate::vendor::SimulatedPlatform;

/// Launch measurement every simulated VM reports.
pub const TEST_MEASUREMENT: [u8; 48] = [0x42; 48];

/// A policy document for one container, with its exact bytes.
pub fn policy_bytes(name: &str, image_digest_byte: u8) -> Vec<u8> {
    let doc = PolicyDocument::new(
        PolicyRules::default(),
        vec![ContainerPolicy {
            name: name.to_string(),
            image_digests: vec![format!("sha256:{}", hex::encode([image_digest_byte; 32]))],
            command: vec!["/bin/server".to_string()],
            env: vec!["PATH=*".to_string()],
            mounts: vec![],
            exec_commands: vec![],
        }],
    );
    doc.to_bytes().unwrap_or_default()
}

pub struct TestDeployment {
    pub platform: Arc<SimulatedPlatform>,
    pub coordinator_policy: Vec<u8>,
}

impl TestDeployment {
    pub fn new(vendor_seed: &[u8]) -> Self {
        let platform = SimulatedPlatform::from_seed(vendor_seed)
            .map(Arc::new)
            .unwrap_or_else(|e| panic!("simulated platform: {}", e));
        Self {
            platform,
            coordinator_policy: policy_bytes("coordinator", 0xC0),
        }
    }

    pub fn reference_values(&self) -> SnpReferenceValues {
        SnpReferenceValues {
            product_name: ProductName::Milan,
            trusted_measurement: HexString::from_bytes(&TEST_MEASUREMENT),
            minimum_tcb: SnpTcb {
                bootloader: 3,
                tee: 0,
                snp: 8,
                microcode: 115,
            },
            trusted_root_key_digest: HexString::from_bytes(&self.platform.root_key_digest()),
        }
    }

    /// Issuer for a VM launched with `policy` as host data.
    pub fn issuer(&self, policy: &[u8]) -> SimulatedIssuer {
        SimulatedIssuer::new(
            self.platform.clone(),
            LaunchParameters::new(TEST_MEASUREMENT, *PolicyDigest::of(policy).as_bytes()),
        )
    }

    pub fn coordinator_issuer(&self) -> SimulatedIssuer {
        self.issuer(&self.coordinator_policy)
    }

    /// Manifest permitting the coordinator policy plus `workloads`, each given
    /// as `(policy bytes, name)`. The name is used as SAN and secret id.
    pub fn manifest(&self, workloads: &[(&[u8], &str)]) -> Manifest {
        let mut policies = BTreeMap::new();
        policies.insert(
            PolicyDigest::of(&self.coordinator_policy).to_hex(),
            PolicyEntry {
                sans: vec!["coordinator".to_string()],
                workload_secret_id: None,
                role: Role::Coordinator,
            },
        );
        for (policy, name) in workloads {
            policies.insert(
                PolicyDigest::of(policy).to_hex(),
                PolicyEntry {
                    sans: vec![name.to_string()],
                    workload_secret_id: Some(name.to_string()),
                    role: Role::None,
                },
            );
        }
        Manifest {
            policies,
            reference_values: ReferenceValues {
                snp: vec![self.reference_values()],
            },
            workload_owner_key_digests: vec![],
            seedshare_owner_pub_keys: vec![],
        }
    }
}
