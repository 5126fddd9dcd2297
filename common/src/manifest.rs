//! Coordinator manifest: permitted policies, reference values and owner keys.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ContrastError, Result};
use crate::report::{TcbVersion, HOST_DATA_SIZE, MEASUREMENT_SIZE};

/// Domain separator for workload-owner manifest update signatures.
pub const SET_MANIFEST_DOMAIN: &[u8] = b"contrast-set-manifest-v1";

/// Lowercase hex string, validated on deserialization.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexString(String);

impl HexString {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Validated at construction.
        hex::decode(&self.0).unwrap_or_default()
    }

    /// Number of decoded bytes.
    pub fn byte_len(&self) -> usize {
        self.0.len() / 2
    }
}

impl TryFrom<String> for HexString {
    type Error = ContrastError;

    fn try_from(value: String) -> Result<Self> {
        let lower = value.trim().to_ascii_lowercase();
        hex::decode(&lower)
            .map_err(|e| ContrastError::InvalidInput(format!("invalid hex '{}': {}", value, e)))?;
        Ok(Self(lower))
    }
}

impl std::str::FromStr for HexString {
    type Err = ContrastError;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s.to_string())
    }
}

impl From<HexString> for String {
    fn from(value: HexString) -> Self {
        value.0
    }
}

impl std::fmt::Display for HexString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role a policy plays in the deployment.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    None,
    Coordinator,
}

/// Trust attributes granted to workloads running a given policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyEntry {
    /// Subject alternative names for the workload certificate.
    #[serde(default)]
    pub sans: Vec<String>,
    /// Identifier the workload secret is derived from. No secret if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_secret_id: Option<String>,
    #[serde(default)]
    pub role: Role,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductName {
    Milan,
    Genoa,
}

/// Minimum acceptable TCB component versions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnpTcb {
    pub bootloader: u8,
    pub tee: u8,
    pub snp: u8,
    pub microcode: u8,
}

impl SnpTcb {
    /// Component-wise comparison. Returns the first component below minimum
    /// as `(field, minimum, observed)`.
    pub fn first_violation(&self, observed: &TcbVersion) -> Option<(&'static str, u8, u8)> {
        let checks = [
            ("bootloader", self.bootloader, observed.bootloader),
            ("tee", self.tee, observed.tee),
            ("snp", self.snp, observed.snp),
            ("microcode", self.microcode, observed.microcode),
        ];
        checks.into_iter().find(|(_, min, seen)| seen < min)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnpReferenceValues {
    pub product_name: ProductName,
    /// Expected launch measurement (48 bytes).
    pub trusted_measurement: HexString,
    pub minimum_tcb: SnpTcb,
    /// SHA-256 over the SubjectPublicKeyInfo of the trusted vendor root key.
    pub trusted_root_key_digest: HexString,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ReferenceValues {
    #[serde(default)]
    pub snp: Vec<SnpReferenceValues>,
}

/// The Coordinator's configuration document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    /// Policy digest to trust attributes.
    pub policies: BTreeMap<HexString, PolicyEntry>,
    pub reference_values: ReferenceValues,
    /// SHA-256 digests of Ed25519 keys allowed to update this manifest.
    #[serde(default)]
    pub workload_owner_key_digests: Vec<HexString>,
    /// RSA public keys (PKCS#1 DER) that receive a seed share.
    #[serde(default)]
    pub seedshare_owner_pub_keys: Vec<HexString>,
}

impl Manifest {
    /// Parse and validate a manifest from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| ContrastError::InvalidManifest(format!("parse error: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.policies.is_empty() {
            return Err(ContrastError::InvalidManifest(
                "manifest must permit at least one policy".to_string(),
            ));
        }
        for (digest, entry) in &self.policies {
            if digest.byte_len() != HOST_DATA_SIZE {
                return Err(ContrastError::InvalidManifest(format!(
                    "policy digest {} must be {} bytes",
                    digest, HOST_DATA_SIZE
                )));
            }
            if entry.sans.iter().any(|s| s.trim().is_empty()) {
                return Err(ContrastError::InvalidManifest(format!(
                    "policy {} has an empty subject alternative name",
                    digest
                )));
            }
            if matches!(&entry.workload_secret_id, Some(id) if id.is_empty()) {
                return Err(ContrastError::InvalidManifest(format!(
                    "policy {} has an empty workload secret id",
                    digest
                )));
            }
        }
        let coordinators = self
            .policies
            .values()
            .filter(|e| e.role == Role::Coordinator)
            .count();
        if coordinators != 1 {
            return Err(ContrastError::InvalidManifest(format!(
                "expected exactly one coordinator policy, found {}",
                coordinators
            )));
        }

        if self.reference_values.snp.is_empty() {
            return Err(ContrastError::InvalidManifest(
                "reference values must contain at least one SNP entry".to_string(),
            ));
        }
        for rv in &self.reference_values.snp {
            if rv.trusted_measurement.byte_len() != MEASUREMENT_SIZE {
                return Err(ContrastError::InvalidManifest(format!(
                    "trusted measurement for {:?} must be {} bytes",
                    rv.product_name, MEASUREMENT_SIZE
                )));
            }
            if rv.trusted_root_key_digest.byte_len() != 32 {
                return Err(ContrastError::InvalidManifest(format!(
                    "trusted root key digest for {:?} must be 32 bytes",
                    rv.product_name
                )));
            }
        }

        for digest in &self.workload_owner_key_digests {
            if digest.byte_len() != 32 {
                return Err(ContrastError::InvalidManifest(format!(
                    "workload owner key digest {} must be 32 bytes",
                    digest
                )));
            }
        }
        self.seedshare_owner_keys()?;
        Ok(())
    }

    /// Canonical encoding: compact JSON with lexicographically sorted keys.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_vec(&value)?)
    }

    /// SHA-256 of the canonical encoding.
    pub fn hash(&self) -> Result<[u8; 32]> {
        Ok(Sha256::digest(self.canonical_bytes()?).into())
    }

    /// The single policy entry with the coordinator role.
    pub fn coordinator_policy(&self) -> Result<(&HexString, &PolicyEntry)> {
        self.policies
            .iter()
            .find(|(_, e)| e.role == Role::Coordinator)
            .ok_or_else(|| ContrastError::InvalidManifest("no coordinator policy".to_string()))
    }

    /// Entry for a raw host-data value, if permitted.
    pub fn policy_for(&self, host_data: &[u8]) -> Option<&PolicyEntry> {
        self.policies.get(&HexString::from_bytes(host_data))
    }

    pub fn is_workload_owner(&self, key: &VerifyingKey) -> bool {
        let digest = HexString::from_bytes(&Sha256::digest(key.as_bytes()));
        self.workload_owner_key_digests.contains(&digest)
    }

    pub fn seedshare_owner_keys(&self) -> Result<Vec<RsaPublicKey>> {
        self.seedshare_owner_pub_keys
            .iter()
            .map(|k| {
                RsaPublicKey::from_pkcs1_der(&k.to_bytes()).map_err(|e| {
                    ContrastError::InvalidManifest(format!("invalid seed share owner key: {}", e))
                })
            })
            .collect()
    }
}

/// Digest of an Ed25519 workload-owner key as it appears in a manifest.
pub fn workload_owner_key_digest(key: &VerifyingKey) -> HexString {
    HexString::from_bytes(&Sha256::digest(key.as_bytes()))
}

/// Authorization for a manifest update.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpdateAuthorization {
    /// Ed25519 public key of the workload owner.
    pub owner_public_key: HexString,
    pub signature: HexString,
}

fn update_message(previous_manifest_hash: &[u8; 32], manifest: &Manifest) -> Result<Vec<u8>> {
    let mut message = SET_MANIFEST_DOMAIN.to_vec();
    message.extend_from_slice(previous_manifest_hash);
    message.extend_from_slice(&manifest.canonical_bytes()?);
    Ok(message)
}

impl UpdateAuthorization {
    /// Sign an update replacing the manifest with hash `previous_manifest_hash`.
    pub fn sign(
        key: &SigningKey,
        previous_manifest_hash: &[u8; 32],
        manifest: &Manifest,
    ) -> Result<Self> {
        let message = update_message(previous_manifest_hash, manifest)?;
        Ok(Self {
            owner_public_key: HexString::from_bytes(key.verifying_key().as_bytes()),
            signature: HexString::from_bytes(&key.sign(&message).to_bytes()),
        })
    }

    /// Check the signature and that the signer is a workload owner of `active`.
    pub fn verify(
        &self,
        active: &Manifest,
        previous_manifest_hash: &[u8; 32],
        manifest: &Manifest,
    ) -> Result<()> {
        let key_bytes: [u8; 32] = self
            .owner_public_key
            .to_bytes()
            .try_into()
            .map_err(|_| ContrastError::Unauthorized("owner key must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| ContrastError::Unauthorized(format!("invalid owner key: {}", e)))?;
        if !active.is_workload_owner(&key) {
            return Err(ContrastError::Unauthorized(
                "key is not a workload owner of the active manifest".to_string(),
            ));
        }
        let sig_bytes: [u8; 64] = self
            .signature
            .to_bytes()
            .try_into()
            .map_err(|_| ContrastError::Unauthorized("signature must be 64 bytes".to_string()))?;
        let message = update_message(previous_manifest_hash, manifest)?;
        key.verify(&message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| ContrastError::Unauthorized("invalid update signature".to_string()))
    }
}
