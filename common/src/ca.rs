//! Coordinator certificate authorities.
//!
//! The root CA key is derived from the secret seed and stays the same across
//! manifest updates and restarts. The mesh CA key is derived from the seed and
//! the current transition hash, so every manifest update rotates it and
//! invalidates certificates issued under the previous manifest.

use ed25519_dalek::VerifyingKey;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SignatureAlgorithm,
};
use time::{Duration, OffsetDateTime};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::time::ASN1Time;

use crate::crypto::p384_to_rcgen;
use crate::error::{ContrastError, Result};
use crate::seed::SeedEngine;

/// Lifetime of workload certificates.
pub const CERT_VALIDITY: Duration = Duration::hours(24);
const CA_VALIDITY: Duration = Duration::days(365);
const CLOCK_SKEW: Duration = Duration::minutes(5);

/// Extension carrying the workload's policy digest.
pub const POLICY_DIGEST_OID: &[u64] = &[2, 25, 2_749_161_837, 1];
const POLICY_DIGEST_OID_STR: &str = "2.25.2749161837.1";
/// Extension carrying the manifest generation the certificate was issued under.
pub const GENERATION_OID: &[u64] = &[2, 25, 2_749_161_837, 2];
const GENERATION_OID_STR: &str = "2.25.2749161837.2";

const ORGANIZATION: &str = "Contrast";

/// Raw Ed25519 public key presented by a workload.
struct WorkloadPublicKey([u8; 32]);

impl PublicKeyData for WorkloadPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.0
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &rcgen::PKCS_ED25519
    }
}

fn ca_params(common_name: &str, is_ca: IsCa, validity: Duration) -> CertificateParams {
    let now = OffsetDateTime::now_utc();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = is_ca;
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = now - CLOCK_SKEW;
    params.not_after = now + validity;
    params
}

fn octet_string(content: &[u8]) -> Vec<u8> {
    let mut out = vec![0x04, content.len() as u8];
    out.extend_from_slice(content);
    out
}

/// Root CA and the mesh CA of one manifest generation.
pub struct CertificateAuthority {
    root_pem: String,
    mesh_params: CertificateParams,
    mesh_key: KeyPair,
    mesh_pem: String,
    generation: u64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    pub fn new(engine: &SeedEngine, transition_hash: &[u8; 32], generation: u64) -> Result<Self> {
        let root_key = p384_to_rcgen(&engine.root_ca_key()?)?;
        let mesh_key = p384_to_rcgen(&engine.mesh_ca_key(transition_hash)?)?;

        let root_params = ca_params(
            "system:coordinator:root",
            IsCa::Ca(BasicConstraints::Unconstrained),
            CA_VALIDITY,
        );
        let root_cert = root_params.self_signed(&root_key)?;

        let mesh_params = ca_params(
            "system:coordinator:mesh",
            IsCa::Ca(BasicConstraints::Constrained(0)),
            CA_VALIDITY,
        );
        let mesh_cert =
            mesh_params.signed_by(&mesh_key, &Issuer::from_params(&root_params, &root_key))?;

        Ok(Self {
            root_pem: root_cert.pem(),
            mesh_pem: mesh_cert.pem(),
            mesh_params,
            mesh_key,
            generation,
        })
    }

    pub fn root_ca_pem(&self) -> &str {
        &self.root_pem
    }

    pub fn mesh_ca_pem(&self) -> &str {
        &self.mesh_pem
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Issue a mesh certificate for a workload key.
    pub fn issue_workload_cert(
        &self,
        public_key: &VerifyingKey,
        sans: &[String],
        policy_digest: &[u8; 32],
    ) -> Result<String> {
        let mut params = CertificateParams::new(sans.to_vec())?;
        let now = OffsetDateTime::now_utc();
        params.distinguished_name.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name.push(
            DnType::CommonName,
            sans.first().map(String::as_str).unwrap_or("workload"),
        );
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + CERT_VALIDITY;
        params.custom_extensions.push(CustomExtension::from_oid_content(
            POLICY_DIGEST_OID,
            octet_string(policy_digest),
        ));
        params.custom_extensions.push(CustomExtension::from_oid_content(
            GENERATION_OID,
            octet_string(&self.generation.to_be_bytes()),
        ));

        let cert = params.signed_by(
            &WorkloadPublicKey(public_key.to_bytes()),
            &Issuer::from_params(&self.mesh_params, &self.mesh_key),
        )?;
        Ok(cert.pem())
    }
}

fn pem_der(pem: &str) -> Result<Vec<u8>> {
    let (_, parsed) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| ContrastError::CertificateError(format!("invalid PEM: {}", e)))?;
    Ok(parsed.contents)
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ContrastError::CertificateError(format!("invalid certificate: {}", e)))?;
    Ok(cert)
}

/// Check that `cert_pem` is currently valid and signed by `issuer_pem`.
pub fn verify_issued_by(cert_pem: &str, issuer_pem: &str) -> Result<()> {
    let cert_der = pem_der(cert_pem)?;
    let issuer_der = pem_der(issuer_pem)?;
    let cert = parse(&cert_der)?;
    let issuer = parse(&issuer_der)?;

    if !cert.validity().is_valid_at(ASN1Time::now()) {
        return Err(ContrastError::CertificateError(
            "certificate is outside its validity period".to_string(),
        ));
    }
    if cert.issuer().as_raw() != issuer.subject().as_raw() {
        return Err(ContrastError::CertificateError(
            "issuer name does not match".to_string(),
        ));
    }
    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|e| ContrastError::CertificateError(format!("signature invalid: {}", e)))
}

/// Identity attributes of an issued workload certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadIdentity {
    pub sans: Vec<String>,
    pub policy_digest: [u8; 32],
    pub generation: u64,
    /// Raw Ed25519 key the certificate was issued for.
    pub public_key: Vec<u8>,
}

pub fn inspect_workload_cert(cert_pem: &str) -> Result<WorkloadIdentity> {
    let der = pem_der(cert_pem)?;
    let cert = parse(&der)?;

    let mut sans = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => sans.push(dns.to_string()),
                GeneralName::IPAddress(raw) => sans.push(ip_to_string(raw)),
                _ => {}
            }
        }
    }

    let ext_value = |oid: &str| {
        cert.extensions()
            .iter()
            .find(|e| e.oid.to_id_string() == oid)
            .map(|e| e.value)
    };

    let policy_digest = match ext_value(POLICY_DIGEST_OID_STR) {
        Some([0x04, 0x20, rest @ ..]) if rest.len() == 32 => {
            let mut d = [0u8; 32];
            d.copy_from_slice(rest);
            d
        }
        _ => {
            return Err(ContrastError::CertificateError(
                "missing policy digest extension".to_string(),
            ))
        }
    };
    let generation = match ext_value(GENERATION_OID_STR) {
        Some([0x04, 0x08, rest @ ..]) if rest.len() == 8 => {
            let mut g = [0u8; 8];
            g.copy_from_slice(rest);
            u64::from_be_bytes(g)
        }
        _ => {
            return Err(ContrastError::CertificateError(
                "missing generation extension".to_string(),
            ))
        }
    };

    Ok(WorkloadIdentity {
        sans,
        policy_digest,
        generation,
        public_key: cert.public_key().subject_public_key.data.to_vec(),
    })
}

fn ip_to_string(raw: &[u8]) -> String {
    match raw.len() {
        4 => std::net::Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string(),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => hex::encode(raw),
    }
}
