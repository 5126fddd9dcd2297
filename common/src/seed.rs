//! Secret seed and everything derived from it.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{derive_p384, hkdf_expand};
use crate::error::{ContrastError, Result};

pub const SEED_SIZE: usize = 64;
pub const SALT_SIZE: usize = 32;
pub const WORKLOAD_SECRET_SIZE: usize = 32;

const INFO_HISTORY_SIGNING: &[u8] = b"TRANSACTION SIGNING SECRET";
const INFO_ROOT_CA: &[u8] = b"ROOT CA SECRET";
const INFO_MESH_CA: &[u8] = b"MESH CA SECRET ";
const INFO_WORKLOAD: &[u8] = b"WORKLOAD SECRET ";

/// Deterministic key factory over a 64-byte seed and a 32-byte salt.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SeedEngine {
    seed: [u8; SEED_SIZE],
    salt: [u8; SALT_SIZE],
}

impl std::fmt::Debug for SeedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SeedEngine(..)")
    }
}

impl SeedEngine {
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_SIZE];
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut seed);
        OsRng.fill_bytes(&mut salt);
        Self { seed, salt }
    }

    pub fn new(seed: &[u8], salt: &[u8]) -> Result<Self> {
        let seed: [u8; SEED_SIZE] = seed.try_into().map_err(|_| {
            ContrastError::InvalidInput(format!("seed must be {} bytes", SEED_SIZE))
        })?;
        let salt: [u8; SALT_SIZE] = salt.try_into().map_err(|_| {
            ContrastError::InvalidInput(format!("salt must be {} bytes", SALT_SIZE))
        })?;
        Ok(Self { seed, salt })
    }

    pub fn seed(&self) -> &[u8; SEED_SIZE] {
        &self.seed
    }

    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    /// Key that signs the manifest history's `latest` pointer.
    pub fn history_signing_key(&self) -> Result<SigningKey> {
        let okm = hkdf_expand::<32>(&self.seed, &self.salt, INFO_HISTORY_SIGNING)?;
        Ok(SigningKey::from_bytes(&okm))
    }

    pub fn root_ca_key(&self) -> Result<p384::SecretKey> {
        derive_p384(&self.seed, &self.salt, INFO_ROOT_CA)
    }

    /// Mesh CA key for the manifest transition `transition_hash`.
    pub fn mesh_ca_key(&self, transition_hash: &[u8; 32]) -> Result<p384::SecretKey> {
        let mut info = INFO_MESH_CA.to_vec();
        info.extend_from_slice(hex::encode(transition_hash).as_bytes());
        derive_p384(&self.seed, &self.salt, &info)
    }

    pub fn workload_secret(
        &self,
        workload_secret_id: &str,
    ) -> Result<Zeroizing<[u8; WORKLOAD_SECRET_SIZE]>> {
        if workload_secret_id.is_empty() {
            return Err(ContrastError::InvalidInput(
                "workload secret id must not be empty".to_string(),
            ));
        }
        let mut info = INFO_WORKLOAD.to_vec();
        info.extend_from_slice(workload_secret_id.as_bytes());
        hkdf_expand::<WORKLOAD_SECRET_SIZE>(&self.seed, &self.salt, &info)
    }
}
