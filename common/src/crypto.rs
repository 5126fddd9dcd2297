//! Key derivation and key-format helpers shared by the seed engine, the CA and
//! the simulated vendor hierarchy.

use hkdf::Hkdf;
use p384::pkcs8::{EncodePrivateKey, LineEnding};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::{ContrastError, Result};

/// HKDF-SHA256 expand into `N` bytes.
pub fn hkdf_expand<const N: usize>(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; N]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; N]);
    hk.expand(info, okm.as_mut())
        .map_err(|e| ContrastError::KeyDerivation(format!("hkdf expand: {}", e)))?;
    Ok(okm)
}

/// Deterministic P-384 private key from key material.
pub fn derive_p384(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<p384::SecretKey> {
    let okm = hkdf_expand::<48>(ikm, salt, info)?;
    p384::SecretKey::from_slice(okm.as_ref())
        .map_err(|e| ContrastError::KeyDerivation(format!("p384 scalar: {}", e)))
}

/// Convert a P-384 key into an rcgen signing key.
pub fn p384_to_rcgen(key: &p384::SecretKey) -> Result<rcgen::KeyPair> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| ContrastError::KeyDerivation(format!("pkcs8 encode: {}", e)))?;
    Ok(rcgen::KeyPair::from_pem(&pem)?)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha512(data: &[u8]) -> [u8; 64] {
    Sha512::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic_and_domain_separated() {
        let a = hkdf_expand::<32>(b"ikm", b"salt", b"one").unwrap();
        let b = hkdf_expand::<32>(b"ikm", b"salt", b"one").unwrap();
        let c = hkdf_expand::<32>(b"ikm", b"salt", b"two").unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_p384_key_converts_to_rcgen() {
        let key = derive_p384(&[7u8; 64], &[1u8; 32], b"test").unwrap();
        let kp = p384_to_rcgen(&key).unwrap();
        assert!(kp.is_compatible(&rcgen::PKCS_ECDSA_P384_SHA384));
    }
}
