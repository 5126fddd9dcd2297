//! Seed escrow: the secret seed encrypted to each seed-share owner, and the
//! signed request that hands it back during recovery.

use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs1v15;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{ContrastError, Result};
use crate::manifest::HexString;
use crate::seed::SeedEngine;

const OAEP_LABEL: &str = "seedshare";
pub const RECOVER_DOMAIN: &[u8] = b"contrast-recover-v1";

/// The seed encrypted to one owner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SeedShare {
    /// Owner's RSA public key, PKCS#1 DER.
    pub public_key: HexString,
    pub encrypted_seed: HexString,
}

/// Returned once, by the first manifest set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SeedShareDocument {
    pub salt: HexString,
    pub seed_shares: Vec<SeedShare>,
}

pub fn public_key_hex(key: &RsaPublicKey) -> Result<HexString> {
    let der = key
        .to_pkcs1_der()
        .map_err(|e| ContrastError::EncryptionError(format!("pkcs1 encode: {}", e)))?;
    Ok(HexString::from_bytes(der.as_bytes()))
}

impl SeedShareDocument {
    pub fn encrypt(engine: &SeedEngine, owners: &[RsaPublicKey]) -> Result<Self> {
        let mut seed_shares = Vec::with_capacity(owners.len());
        for owner in owners {
            let ct = owner
                .encrypt(
                    &mut OsRng,
                    Oaep::new_with_label::<Sha256, _>(OAEP_LABEL),
                    engine.seed(),
                )
                .map_err(|e| ContrastError::EncryptionError(format!("seed share: {}", e)))?;
            seed_shares.push(SeedShare {
                public_key: public_key_hex(owner)?,
                encrypted_seed: HexString::from_bytes(&ct),
            });
        }
        Ok(Self {
            salt: HexString::from_bytes(engine.salt()),
            seed_shares,
        })
    }

    /// Decrypt the share that belongs to `key` and rebuild the seed engine.
    pub fn decrypt(&self, key: &RsaPrivateKey) -> Result<SeedEngine> {
        let own = public_key_hex(&key.to_public_key())?;
        let share = self
            .seed_shares
            .iter()
            .find(|s| s.public_key == own)
            .ok_or_else(|| {
                ContrastError::InvalidInput("no seed share for this key".to_string())
            })?;
        let seed = Zeroizing::new(
            key.decrypt(
                Oaep::new_with_label::<Sha256, _>(OAEP_LABEL),
                &share.encrypted_seed.to_bytes(),
            )
            .map_err(|e| ContrastError::DecryptionError(format!("seed share: {}", e)))?,
        );
        SeedEngine::new(&seed, &self.salt.to_bytes())
    }
}

fn recover_message(transport_key: &[u8], sealed_seed: &[u8]) -> Vec<u8> {
    let mut message = RECOVER_DOMAIN.to_vec();
    message.extend_from_slice(transport_key);
    message.extend_from_slice(sealed_seed);
    message
}

/// Sign a recovery payload sealed to `transport_key`.
pub fn sign_recovery(owner: &RsaPrivateKey, transport_key: &[u8], sealed_seed: &[u8]) -> Vec<u8> {
    let signing_key = pkcs1v15::SigningKey::<Sha256>::new(owner.clone());
    signing_key
        .sign(&recover_message(transport_key, sealed_seed))
        .to_vec()
}

/// Accept the signature if any of `owners` produced it.
pub fn verify_recovery(
    owners: &[RsaPublicKey],
    transport_key: &[u8],
    sealed_seed: &[u8],
    signature: &[u8],
) -> Result<()> {
    let signature = pkcs1v15::Signature::try_from(signature)
        .map_err(|_| ContrastError::Unauthorized("malformed recovery signature".to_string()))?;
    let message = recover_message(transport_key, sealed_seed);
    let authorized = owners.iter().any(|owner| {
        pkcs1v15::VerifyingKey::<Sha256>::new(owner.clone())
            .verify(&message, &signature)
            .is_ok()
    });
    if authorized {
        Ok(())
    } else {
        Err(ContrastError::Unauthorized(
            "recovery not signed by a seed share owner".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, 2048).unwrap()
    }

    #[test]
    fn test_share_roundtrip_restores_seed() {
        let key = owner();
        let engine = SeedEngine::generate();
        let doc = SeedShareDocument::encrypt(&engine, &[key.to_public_key()]).unwrap();
        assert_eq!(doc.seed_shares.len(), 1);

        let restored = doc.decrypt(&key).unwrap();
        assert_eq!(restored.seed(), engine.seed());
        assert_eq!(restored.salt(), engine.salt());
    }

    #[test]
    fn test_foreign_key_has_no_share() {
        let doc = SeedShareDocument::encrypt(&SeedEngine::generate(), &[owner().to_public_key()])
            .unwrap();
        assert!(matches!(
            doc.decrypt(&owner()),
            Err(ContrastError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_recovery_signature() {
        let key = owner();
        let owners = vec![key.to_public_key()];
        let sig = sign_recovery(&key, b"transport", b"sealed");

        verify_recovery(&owners, b"transport", b"sealed", &sig).unwrap();
        // Bound to the transport key: cannot be replayed to another Coordinator.
        assert!(verify_recovery(&owners, b"other", b"sealed", &sig).is_err());
        let stranger = [owner().to_public_key()];
        assert!(verify_recovery(&stranger, b"transport", b"sealed", &sig).is_err());
    }
}
