//! HPKE sealing to keys that were bound into an attestation report.
//!
//! Suite: X25519-HKDF-SHA256 / HKDF-SHA256 / ChaCha20-Poly1305, base mode.
//! Wire format: `encapped_key (32 bytes) || ciphertext`.

use hpke::aead::ChaCha20Poly1305;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem, OpModeR, OpModeS, Serializable};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::{ContrastError, Result};

pub const PUBLIC_KEY_SIZE: usize = 32;

/// HPKE info for the recovery payload.
pub const RECOVERY_INFO: &[u8] = b"contrast recovery seed";
/// HPKE info for workload secrets.
pub const WORKLOAD_SECRET_INFO: &[u8] = b"contrast workload secret";

type KemPrivateKey = <X25519HkdfSha256 as Kem>::PrivateKey;
type KemPublicKey = <X25519HkdfSha256 as Kem>::PublicKey;
type EncappedKey = <X25519HkdfSha256 as Kem>::EncappedKey;

/// X25519 key pair that receives sealed payloads.
#[derive(ZeroizeOnDrop)]
pub struct TransportKeyPair {
    private_key: [u8; 32],
    #[zeroize(skip)]
    public_key: [u8; PUBLIC_KEY_SIZE],
}

impl TransportKeyPair {
    pub fn generate() -> Self {
        let (sk, pk) = X25519HkdfSha256::gen_keypair(&mut OsRng);
        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(&sk.to_bytes());
        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        public_key.copy_from_slice(&pk.to_bytes());
        Self {
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key
    }

    /// Open a payload sealed to this key.
    pub fn open(&self, info: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 32 {
            return Err(ContrastError::DecryptionError(
                "Ciphertext too short".to_string(),
            ));
        }
        let (encapped_key_bytes, ciphertext) = sealed.split_at(32);

        let kem_priv = KemPrivateKey::from_bytes(&self.private_key)
            .map_err(|e| ContrastError::DecryptionError(format!("Invalid private key: {}", e)))?;
        let encapped_key = EncappedKey::from_bytes(encapped_key_bytes)
            .map_err(|e| ContrastError::DecryptionError(format!("Invalid encapped key: {}", e)))?;

        let mut receiver_ctx =
            hpke::setup_receiver::<ChaCha20Poly1305, HkdfSha256, X25519HkdfSha256>(
                &OpModeR::Base,
                &kem_priv,
                &encapped_key,
                info,
            )
            .map_err(|e| ContrastError::DecryptionError(format!("HPKE setup failed: {}", e)))?;

        receiver_ctx
            .open(ciphertext, b"")
            .map_err(|e| ContrastError::DecryptionError(format!("HPKE open failed: {}", e)))
    }
}

/// Seal `plaintext` to `recipient`.
pub fn seal(recipient: &[u8], info: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let pk = KemPublicKey::from_bytes(recipient)
        .map_err(|e| ContrastError::EncryptionError(format!("Invalid recipient key: {}", e)))?;
    let (encapped_key, mut sender_ctx) =
        hpke::setup_sender::<ChaCha20Poly1305, HkdfSha256, X25519HkdfSha256, _>(
            &OpModeS::Base,
            &pk,
            info,
            &mut OsRng,
        )
        .map_err(|e| ContrastError::EncryptionError(format!("HPKE setup failed: {}", e)))?;
    let ciphertext = sender_ctx
        .seal(plaintext, b"")
        .map_err(|e| ContrastError::EncryptionError(format!("HPKE seal failed: {}", e)))?;

    let mut out = encapped_key.to_bytes().to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let kp = TransportKeyPair::generate();
        let sealed = seal(&kp.public_key(), RECOVERY_INFO, b"seed material").unwrap();
        assert_eq!(kp.open(RECOVERY_INFO, &sealed).unwrap(), b"seed material");
    }

    #[test]
    fn test_info_is_bound() {
        let kp = TransportKeyPair::generate();
        let sealed = seal(&kp.public_key(), RECOVERY_INFO, b"x").unwrap();
        assert!(kp.open(WORKLOAD_SECRET_INFO, &sealed).is_err());
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let kp = TransportKeyPair::generate();
        let other = TransportKeyPair::generate();
        let sealed = seal(&kp.public_key(), RECOVERY_INFO, b"x").unwrap();
        assert!(matches!(
            other.open(RECOVERY_INFO, &sealed),
            Err(ContrastError::DecryptionError(_))
        ));
        assert!(kp.open(RECOVERY_INFO, &[0u8; 8]).is_err());
    }
}
