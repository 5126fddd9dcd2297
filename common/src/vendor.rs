//! Hardware vendor certificate hierarchy.
//!
//! ARK (root, self-signed) signs ASK (intermediate), which signs the per-chip
//! VCEK. The VCEK signs attestation reports and carries the chip's hardware ID
//! in a non-critical extension. All keys are ECDSA P-384.
//!
//! `SimulatedPlatform` builds a complete hierarchy deterministically from a
//! seed so tests and local deployments can produce verifiable evidence
//! without SEV-SNP hardware.

use p384::ecdsa::signature::{Signer, Verifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::parse_x509_pem;
use x509_parser::time::ASN1Time;

use crate::crypto::{derive_p384, hkdf_expand, p384_to_rcgen, sha256};
use crate::error::{ContrastError, Result};
use crate::report::{SnpReport, TcbVersion, CHIP_ID_SIZE};
use crate::verify::VerificationError;

/// VCEK extension carrying the chip's hardware ID.
pub const HWID_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 3704, 1, 4];
const HWID_OID_STR: &str = "1.3.6.1.4.1.3704.1.4";

/// PEM-encoded vendor certificates accompanying a report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VendorChain {
    pub ark: String,
    pub ask: String,
    pub vcek: String,
}

impl VendorChain {
    /// Split a PEM bundle ordered leaf to root: VCEK, ASK, ARK.
    pub fn from_pem_bundle(bundle: &str) -> Result<Self> {
        let mut certs = Vec::new();
        let mut rest = bundle.as_bytes();
        while let Some(start) = find_subslice(rest, b"-----BEGIN CERTIFICATE-----") {
            rest = &rest[start..];
            let (remaining, pem) = parse_x509_pem(rest).map_err(|e| {
                ContrastError::ConfigurationError(format!("invalid vendor PEM bundle: {}", e))
            })?;
            certs.push(pem_encode(&pem.contents));
            rest = remaining;
        }
        match <[String; 3]>::try_from(certs) {
            Ok([vcek, ask, ark]) => Ok(Self { ark, ask, vcek }),
            Err(v) => Err(ContrastError::ConfigurationError(format!(
                "vendor PEM bundle must hold VCEK, ASK and ARK, found {} certificates",
                v.len()
            ))),
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn pem_encode(der: &[u8]) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in b64.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

fn chain_error(reason: impl Into<String>) -> VerificationError {
    VerificationError::UntrustedChain {
        reason: reason.into(),
    }
}

fn pem_to_der(name: &str, pem: &str) -> std::result::Result<Vec<u8>, VerificationError> {
    let (_, parsed) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| chain_error(format!("{} is not valid PEM: {}", name, e)))?;
    Ok(parsed.contents)
}

fn parse_der<'a>(
    name: &str,
    der: &'a [u8],
) -> std::result::Result<X509Certificate<'a>, VerificationError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| chain_error(format!("{} is not a valid certificate: {}", name, e)))?;
    if !cert.validity().is_valid_at(ASN1Time::now()) {
        return Err(chain_error(format!("{} is outside its validity period", name)));
    }
    Ok(cert)
}

/// Extract the 64-byte hardware ID from a VCEK. Accepts the extension value
/// either as a bare 64-byte string or wrapped in a DER OCTET STRING.
fn hwid_of(cert: &X509Certificate<'_>) -> Option<[u8; CHIP_ID_SIZE]> {
    let ext = cert
        .extensions()
        .iter()
        .find(|e| e.oid.to_id_string() == HWID_OID_STR)?;
    let value = ext.value;
    let raw = match value {
        [0x04, 0x40, rest @ ..] if rest.len() == CHIP_ID_SIZE => rest,
        v if v.len() == CHIP_ID_SIZE => v,
        _ => return None,
    };
    let mut out = [0u8; CHIP_ID_SIZE];
    out.copy_from_slice(raw);
    Some(out)
}

/// Result of a successful chain check.
#[derive(Debug, Clone)]
pub struct VerifiedChain {
    /// SHA-256 over the ARK SubjectPublicKeyInfo.
    pub root_key_digest: [u8; 32],
    /// VCEK public key as a SEC1 point.
    pub vcek_public_key: Vec<u8>,
}

/// Verify ARK → ASK → VCEK and bind the VCEK to `chip_id`.
///
/// The trust decision on the root is left to the caller: it gets the root key
/// digest back and compares it to its pinned values.
pub fn verify_chain(
    chain: &VendorChain,
    chip_id: &[u8; CHIP_ID_SIZE],
) -> std::result::Result<VerifiedChain, VerificationError> {
    let ark_der = pem_to_der("ARK", &chain.ark)?;
    let ask_der = pem_to_der("ASK", &chain.ask)?;
    let vcek_der = pem_to_der("VCEK", &chain.vcek)?;
    let ark = parse_der("ARK", &ark_der)?;
    let ask = parse_der("ASK", &ask_der)?;
    let vcek = parse_der("VCEK", &vcek_der)?;

    ark.verify_signature(None)
        .map_err(|e| chain_error(format!("ARK self-signature invalid: {}", e)))?;
    ask.verify_signature(Some(ark.public_key()))
        .map_err(|e| chain_error(format!("ASK not signed by ARK: {}", e)))?;
    vcek.verify_signature(Some(ask.public_key()))
        .map_err(|e| chain_error(format!("VCEK not signed by ASK: {}", e)))?;

    if ark.subject().as_raw() != ask.issuer().as_raw()
        || ask.subject().as_raw() != vcek.issuer().as_raw()
    {
        return Err(chain_error("issuer and subject names do not chain"));
    }

    match hwid_of(&vcek) {
        Some(hwid) if &hwid == chip_id => {}
        Some(hwid) => {
            return Err(chain_error(format!(
                "VCEK hardware ID {} does not match report chip_id {}",
                hex::encode(&hwid[..8]),
                hex::encode(&chip_id[..8])
            )))
        }
        None => return Err(chain_error("VCEK has no hardware ID extension")),
    }

    let point: &[u8] = &vcek.public_key().subject_public_key.data;
    if point.is_empty() {
        return Err(chain_error("VCEK has an empty public key"));
    }

    Ok(VerifiedChain {
        root_key_digest: sha256(ark.public_key().raw),
        vcek_public_key: point.to_vec(),
    })
}

/// Verify the report signature with the VCEK key.
pub fn verify_report_signature(
    report: &SnpReport,
    vcek_public_key: &[u8],
) -> std::result::Result<(), VerificationError> {
    let key = VerifyingKey::from_sec1_bytes(vcek_public_key).map_err(|e| {
        VerificationError::BadSignature {
            reason: format!("VCEK key is not a P-384 point: {}", e),
        }
    })?;
    let mut rs = [0u8; 96];
    rs[..48].copy_from_slice(&report.signature_r);
    rs[48..].copy_from_slice(&report.signature_s);
    let signature = Signature::from_slice(&rs).map_err(|e| VerificationError::BadSignature {
        reason: format!("malformed report signature: {}", e),
    })?;
    key.verify(&report.signed_bytes(), &signature)
        .map_err(|_| VerificationError::BadSignature {
            reason: "report signature does not verify under the VCEK".to_string(),
        })
}

/// Deterministic stand-in for the vendor and the security processor.
pub struct SimulatedPlatform {
    vcek_key: p384::SecretKey,
    chain: VendorChain,
    chip_id: [u8; CHIP_ID_SIZE],
    root_key_digest: [u8; 32],
    tcb: TcbVersion,
}

impl std::fmt::Debug for SimulatedPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedPlatform")
            .field("chip_id", &hex::encode(&self.chip_id[..8]))
            .field("root_key_digest", &hex::encode(self.root_key_digest))
            .field("tcb", &self.tcb)
            .finish()
    }
}

const SIM_SALT: &[u8] = b"contrast-simulated-vendor";

fn ca_params(common_name: &str, constrained: bool) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::OrganizationName, "Simulated Vendor");
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = if constrained {
        IsCa::Ca(BasicConstraints::Constrained(0))
    } else {
        IsCa::Ca(BasicConstraints::Unconstrained)
    };
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params
}

impl SimulatedPlatform {
    /// Build the hierarchy for `seed`. Same seed, same keys and chip ID.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let ark_key = derive_p384(seed, SIM_SALT, b"ARK")?;
        let ask_key = derive_p384(seed, SIM_SALT, b"ASK")?;
        let vcek_key = derive_p384(seed, SIM_SALT, b"VCEK")?;
        let chip_id = *hkdf_expand::<CHIP_ID_SIZE>(seed, SIM_SALT, b"CHIP ID")?;

        let ark_kp: KeyPair = p384_to_rcgen(&ark_key)?;
        let ask_kp: KeyPair = p384_to_rcgen(&ask_key)?;
        let vcek_kp: KeyPair = p384_to_rcgen(&vcek_key)?;

        let ark_params = ca_params("ARK-Simulated", false);
        let ark_cert = ark_params.self_signed(&ark_kp)?;

        let ask_params = ca_params("SEV-Simulated", true);
        let ask_cert = ask_params.signed_by(&ask_kp, &Issuer::from_params(&ark_params, &ark_kp))?;

        let mut vcek_params = CertificateParams::default();
        vcek_params
            .distinguished_name
            .push(DnType::OrganizationName, "Simulated Vendor");
        vcek_params.distinguished_name.push(DnType::CommonName, "SEV-VCEK");
        let mut hwid = vec![0x04, 0x40];
        hwid.extend_from_slice(&chip_id);
        vcek_params
            .custom_extensions
            .push(CustomExtension::from_oid_content(HWID_OID, hwid));
        let vcek_cert =
            vcek_params.signed_by(&vcek_kp, &Issuer::from_params(&ask_params, &ask_kp))?;

        let ark_pem = ark_cert.pem();
        let (_, ark_parsed) = parse_x509_pem(ark_pem.as_bytes())
            .map_err(|e| ContrastError::CertificateError(format!("ARK PEM: {}", e)))?;
        let (_, ark_x509) = x509_parser::parse_x509_certificate(&ark_parsed.contents)
            .map_err(|e| ContrastError::CertificateError(format!("ARK DER: {}", e)))?;
        let root_key_digest = sha256(ark_x509.public_key().raw);

        Ok(Self {
            vcek_key,
            chain: VendorChain {
                ark: ark_pem,
                ask: ask_cert.pem(),
                vcek: vcek_cert.pem(),
            },
            chip_id,
            root_key_digest,
            tcb: TcbVersion {
                bootloader: 3,
                tee: 0,
                snp: 14,
                microcode: 209,
            },
        })
    }

    /// Override the TCB the simulated firmware reports.
    pub fn with_tcb(mut self, tcb: TcbVersion) -> Self {
        self.tcb = tcb;
        self
    }

    pub fn vendor_chain(&self) -> &VendorChain {
        &self.chain
    }

    pub fn chip_id(&self) -> &[u8; CHIP_ID_SIZE] {
        &self.chip_id
    }

    pub fn root_key_digest(&self) -> [u8; 32] {
        self.root_key_digest
    }

    pub fn tcb(&self) -> TcbVersion {
        self.tcb
    }

    /// Fill platform fields and sign the report in place.
    pub fn sign_report(&self, report: &mut SnpReport) {
        report.chip_id = self.chip_id;
        report.reported_tcb = self.tcb;
        report.current_tcb = self.tcb;
        report.committed_tcb = self.tcb;
        report.launch_tcb = self.tcb;
        self.resign(report);
    }

    /// Sign without touching any field. Tests use this to forge reports whose
    /// content is wrong but whose signature is valid.
    pub fn resign(&self, report: &mut SnpReport) {
        let signing_key = SigningKey::from(&self.vcek_key);
        let signature: Signature = signing_key.sign(&report.signed_bytes());
        let bytes = signature.to_bytes();
        report.signature_r.copy_from_slice(&bytes[..48]);
        report.signature_s.copy_from_slice(&bytes[48..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> SimulatedPlatform {
        SimulatedPlatform::from_seed(b"vendor-test-seed").unwrap()
    }

    #[test]
    fn test_simulated_chain_verifies() {
        let p = platform();
        let verified = verify_chain(p.vendor_chain(), p.chip_id()).unwrap();
        assert_eq!(verified.root_key_digest, p.root_key_digest());
    }

    #[test]
    fn test_same_seed_same_root() {
        let a = platform();
        let b = platform();
        assert_eq!(a.root_key_digest(), b.root_key_digest());
        assert_eq!(a.chip_id(), b.chip_id());

        let other = SimulatedPlatform::from_seed(b"another-vendor").unwrap();
        assert_ne!(a.root_key_digest(), other.root_key_digest());
    }

    #[test]
    fn test_chip_id_binding() {
        let p = platform();
        let wrong = [0u8; CHIP_ID_SIZE];
        let err = verify_chain(p.vendor_chain(), &wrong).unwrap_err();
        assert!(matches!(err, VerificationError::UntrustedChain { .. }));
    }

    #[test]
    fn test_mixed_chain_rejected() {
        let a = platform();
        let b = SimulatedPlatform::from_seed(b"another-vendor").unwrap();
        let mixed = VendorChain {
            ark: b.vendor_chain().ark.clone(),
            ask: a.vendor_chain().ask.clone(),
            vcek: a.vendor_chain().vcek.clone(),
        };
        assert!(verify_chain(&mixed, a.chip_id()).is_err());
    }

    #[test]
    fn test_report_signature() {
        let p = platform();
        let mut report = SnpReport::default();
        report.host_data = [9; 32];
        p.sign_report(&mut report);

        let verified = verify_chain(p.vendor_chain(), &report.chip_id).unwrap();
        verify_report_signature(&report, &verified.vcek_public_key).unwrap();

        report.host_data[0] ^= 1;
        let err = verify_report_signature(&report, &verified.vcek_public_key).unwrap_err();
        assert!(matches!(err, VerificationError::BadSignature { .. }));
    }

    #[test]
    fn test_signature_survives_wire_encoding() {
        let p = platform();
        let mut report = SnpReport::default();
        p.sign_report(&mut report);
        let decoded = SnpReport::from_bytes(&report.to_bytes()).unwrap();
        let verified = verify_chain(p.vendor_chain(), &decoded.chip_id).unwrap();
        verify_report_signature(&decoded, &verified.vcek_public_key).unwrap();
    }

    #[test]
    fn test_pem_bundle_split() {
        let p = platform();
        let chain = p.vendor_chain();
        let bundle = format!("{}{}{}", chain.vcek, chain.ask, chain.ark);
        let parsed = VendorChain::from_pem_bundle(&bundle).unwrap();
        assert!(verify_chain(&parsed, p.chip_id()).is_ok());

        assert!(VendorChain::from_pem_bundle(&chain.vcek).is_err());
    }
}
