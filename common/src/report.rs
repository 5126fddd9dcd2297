//! SEV-SNP attestation report codec.
//!
//! The report is a fixed 1184-byte little-endian structure. Only the bytes in
//! `0x000..0x2A0` are covered by the ECDSA P-384 signature that follows.

use serde::{Deserialize, Serialize};

use crate::error::{ContrastError, Result};

pub const REPORT_SIZE: usize = 0x4A0;
pub const SIGNED_REGION: usize = 0x2A0;

pub const REPORT_DATA_SIZE: usize = 64;
pub const MEASUREMENT_SIZE: usize = 48;
pub const HOST_DATA_SIZE: usize = 32;
pub const CHIP_ID_SIZE: usize = 64;

/// Guest policy bit that allows a debugger to attach.
pub const POLICY_DEBUG_BIT: u64 = 1 << 19;

/// ECDSA P-384 with SHA-384.
pub const SIG_ALGO_ECDSA_P384_SHA384: u32 = 1;

const OFF_VERSION: usize = 0x00;
const OFF_GUEST_SVN: usize = 0x04;
const OFF_POLICY: usize = 0x08;
const OFF_FAMILY_ID: usize = 0x10;
const OFF_IMAGE_ID: usize = 0x20;
const OFF_VMPL: usize = 0x30;
const OFF_SIG_ALGO: usize = 0x34;
const OFF_CURRENT_TCB: usize = 0x38;
const OFF_PLATFORM_INFO: usize = 0x40;
const OFF_FLAGS: usize = 0x48;
const OFF_REPORT_DATA: usize = 0x50;
const OFF_MEASUREMENT: usize = 0x90;
const OFF_HOST_DATA: usize = 0xC0;
const OFF_ID_KEY_DIGEST: usize = 0xE0;
const OFF_AUTHOR_KEY_DIGEST: usize = 0x110;
const OFF_REPORT_ID: usize = 0x140;
const OFF_REPORT_ID_MA: usize = 0x160;
const OFF_REPORTED_TCB: usize = 0x180;
const OFF_CHIP_ID: usize = 0x1A0;
const OFF_COMMITTED_TCB: usize = 0x1E0;
const OFF_LAUNCH_TCB: usize = 0x1F0;
const OFF_SIG_R: usize = 0x2A0;
const OFF_SIG_S: usize = 0x2E8;
const SIG_COMPONENT_SIZE: usize = 72;

/// Packed TCB version as reported by the security processor.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcbVersion {
    pub bootloader: u8,
    pub tee: u8,
    pub snp: u8,
    pub microcode: u8,
}

impl TcbVersion {
    pub fn from_u64(raw: u64) -> Self {
        let b = raw.to_le_bytes();
        Self {
            bootloader: b[0],
            tee: b[1],
            snp: b[6],
            microcode: b[7],
        }
    }

    pub fn to_u64(self) -> u64 {
        let mut b = [0u8; 8];
        b[0] = self.bootloader;
        b[1] = self.tee;
        b[6] = self.snp;
        b[7] = self.microcode;
        u64::from_le_bytes(b)
    }
}

impl std::fmt::Display for TcbVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bl={} tee={} snp={} ucode={}",
            self.bootloader, self.tee, self.snp, self.microcode
        )
    }
}

/// Decoded attestation report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnpReport {
    pub version: u32,
    pub guest_svn: u32,
    pub policy: u64,
    pub family_id: [u8; 16],
    pub image_id: [u8; 16],
    pub vmpl: u32,
    pub signature_algo: u32,
    pub current_tcb: TcbVersion,
    pub platform_info: u64,
    pub flags: u32,
    pub report_data: [u8; REPORT_DATA_SIZE],
    pub measurement: [u8; MEASUREMENT_SIZE],
    pub host_data: [u8; HOST_DATA_SIZE],
    pub id_key_digest: [u8; 48],
    pub author_key_digest: [u8; 48],
    pub report_id: [u8; 32],
    pub report_id_ma: [u8; 32],
    pub reported_tcb: TcbVersion,
    pub chip_id: [u8; CHIP_ID_SIZE],
    pub committed_tcb: TcbVersion,
    pub launch_tcb: TcbVersion,
    /// Signature R component, big-endian.
    pub signature_r: [u8; 48],
    /// Signature S component, big-endian.
    pub signature_s: [u8; 48],
}

impl Default for SnpReport {
    fn default() -> Self {
        Self {
            version: 2,
            guest_svn: 0,
            policy: 0x3_0000,
            family_id: [0; 16],
            image_id: [0; 16],
            vmpl: 0,
            signature_algo: SIG_ALGO_ECDSA_P384_SHA384,
            current_tcb: TcbVersion::default(),
            platform_info: 0,
            flags: 0,
            report_data: [0; REPORT_DATA_SIZE],
            measurement: [0; MEASUREMENT_SIZE],
            host_data: [0; HOST_DATA_SIZE],
            id_key_digest: [0; 48],
            author_key_digest: [0; 48],
            report_id: [0; 32],
            report_id_ma: [0xff; 32],
            reported_tcb: TcbVersion::default(),
            chip_id: [0; CHIP_ID_SIZE],
            committed_tcb: TcbVersion::default(),
            launch_tcb: TcbVersion::default(),
            signature_r: [0; 48],
            signature_s: [0; 48],
        }
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn read_array<const N: usize>(buf: &[u8], off: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[off..off + N]);
    out
}

/// Reads a little-endian, zero-padded signature component into big-endian form.
fn read_sig_component(buf: &[u8], off: usize) -> Result<[u8; 48]> {
    let field = &buf[off..off + SIG_COMPONENT_SIZE];
    if field[48..].iter().any(|b| *b != 0) {
        return Err(ContrastError::InvalidInput(
            "signature component exceeds 48 bytes".to_string(),
        ));
    }
    let mut out = [0u8; 48];
    for (i, b) in field[..48].iter().enumerate() {
        out[47 - i] = *b;
    }
    Ok(out)
}

fn write_sig_component(buf: &mut [u8], off: usize, be: &[u8; 48]) {
    for (i, b) in be.iter().enumerate() {
        buf[off + 47 - i] = *b;
    }
}

impl SnpReport {
    /// Decode a raw report. Rejects anything that is not exactly one report.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != REPORT_SIZE {
            return Err(ContrastError::InvalidInput(format!(
                "attestation report must be {} bytes, got {}",
                REPORT_SIZE,
                raw.len()
            )));
        }
        Ok(Self {
            version: read_u32(raw, OFF_VERSION),
            guest_svn: read_u32(raw, OFF_GUEST_SVN),
            policy: read_u64(raw, OFF_POLICY),
            family_id: read_array(raw, OFF_FAMILY_ID),
            image_id: read_array(raw, OFF_IMAGE_ID),
            vmpl: read_u32(raw, OFF_VMPL),
            signature_algo: read_u32(raw, OFF_SIG_ALGO),
            current_tcb: TcbVersion::from_u64(read_u64(raw, OFF_CURRENT_TCB)),
            platform_info: read_u64(raw, OFF_PLATFORM_INFO),
            flags: read_u32(raw, OFF_FLAGS),
            report_data: read_array(raw, OFF_REPORT_DATA),
            measurement: read_array(raw, OFF_MEASUREMENT),
            host_data: read_array(raw, OFF_HOST_DATA),
            id_key_digest: read_array(raw, OFF_ID_KEY_DIGEST),
            author_key_digest: read_array(raw, OFF_AUTHOR_KEY_DIGEST),
            report_id: read_array(raw, OFF_REPORT_ID),
            report_id_ma: read_array(raw, OFF_REPORT_ID_MA),
            reported_tcb: TcbVersion::from_u64(read_u64(raw, OFF_REPORTED_TCB)),
            chip_id: read_array(raw, OFF_CHIP_ID),
            committed_tcb: TcbVersion::from_u64(read_u64(raw, OFF_COMMITTED_TCB)),
            launch_tcb: TcbVersion::from_u64(read_u64(raw, OFF_LAUNCH_TCB)),
            signature_r: read_sig_component(raw, OFF_SIG_R)?,
            signature_s: read_sig_component(raw, OFF_SIG_S)?,
        })
    }

    /// Encode into the 1184-byte wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; REPORT_SIZE];
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        buf[OFF_GUEST_SVN..OFF_GUEST_SVN + 4].copy_from_slice(&self.guest_svn.to_le_bytes());
        buf[OFF_POLICY..OFF_POLICY + 8].copy_from_slice(&self.policy.to_le_bytes());
        buf[OFF_FAMILY_ID..OFF_FAMILY_ID + 16].copy_from_slice(&self.family_id);
        buf[OFF_IMAGE_ID..OFF_IMAGE_ID + 16].copy_from_slice(&self.image_id);
        buf[OFF_VMPL..OFF_VMPL + 4].copy_from_slice(&self.vmpl.to_le_bytes());
        buf[OFF_SIG_ALGO..OFF_SIG_ALGO + 4].copy_from_slice(&self.signature_algo.to_le_bytes());
        buf[OFF_CURRENT_TCB..OFF_CURRENT_TCB + 8]
            .copy_from_slice(&self.current_tcb.to_u64().to_le_bytes());
        buf[OFF_PLATFORM_INFO..OFF_PLATFORM_INFO + 8]
            .copy_from_slice(&self.platform_info.to_le_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        buf[OFF_REPORT_DATA..OFF_REPORT_DATA + REPORT_DATA_SIZE].copy_from_slice(&self.report_data);
        buf[OFF_MEASUREMENT..OFF_MEASUREMENT + MEASUREMENT_SIZE].copy_from_slice(&self.measurement);
        buf[OFF_HOST_DATA..OFF_HOST_DATA + HOST_DATA_SIZE].copy_from_slice(&self.host_data);
        buf[OFF_ID_KEY_DIGEST..OFF_ID_KEY_DIGEST + 48].copy_from_slice(&self.id_key_digest);
        buf[OFF_AUTHOR_KEY_DIGEST..OFF_AUTHOR_KEY_DIGEST + 48]
            .copy_from_slice(&self.author_key_digest);
        buf[OFF_REPORT_ID..OFF_REPORT_ID + 32].copy_from_slice(&self.report_id);
        buf[OFF_REPORT_ID_MA..OFF_REPORT_ID_MA + 32].copy_from_slice(&self.report_id_ma);
        buf[OFF_REPORTED_TCB..OFF_REPORTED_TCB + 8]
            .copy_from_slice(&self.reported_tcb.to_u64().to_le_bytes());
        buf[OFF_CHIP_ID..OFF_CHIP_ID + CHIP_ID_SIZE].copy_from_slice(&self.chip_id);
        buf[OFF_COMMITTED_TCB..OFF_COMMITTED_TCB + 8]
            .copy_from_slice(&self.committed_tcb.to_u64().to_le_bytes());
        buf[OFF_LAUNCH_TCB..OFF_LAUNCH_TCB + 8]
            .copy_from_slice(&self.launch_tcb.to_u64().to_le_bytes());
        write_sig_component(&mut buf, OFF_SIG_R, &self.signature_r);
        write_sig_component(&mut buf, OFF_SIG_S, &self.signature_s);
        buf
    }

    /// Bytes covered by the report signature.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = self.to_bytes();
        bytes.truncate(SIGNED_REGION);
        bytes
    }

    /// True if the guest policy permits debugging.
    pub fn debug_allowed(&self) -> bool {
        self.policy & POLICY_DEBUG_BIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcb_packing_layout() {
        let tcb = TcbVersion {
            bootloader: 3,
            tee: 0,
            snp: 14,
            microcode: 209,
        };
        let raw = tcb.to_u64();
        let bytes = raw.to_le_bytes();
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[6], 14);
        assert_eq!(bytes[7], 209);
        assert_eq!(TcbVersion::from_u64(raw), tcb);
    }

    #[test]
    fn test_field_offsets() {
        let mut report = SnpReport::default();
        report.host_data = [0xAB; 32];
        report.measurement = [0xCD; 48];
        report.report_data[0] = 0x11;
        report.chip_id[63] = 0x22;
        report.signature_r[47] = 0x01;

        let raw = report.to_bytes();
        assert_eq!(raw.len(), REPORT_SIZE);
        assert_eq!(&raw[0xC0..0xE0], &[0xAB; 32]);
        assert_eq!(&raw[0x90..0xC0], &[0xCD; 48]);
        assert_eq!(raw[0x50], 0x11);
        assert_eq!(raw[0x1DF], 0x22);
        // R is stored little-endian, so the big-endian low byte lands first.
        assert_eq!(raw[0x2A0], 0x01);

        let decoded = SnpReport::from_bytes(&raw).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn test_signed_region_excludes_signature() {
        let mut report = SnpReport::default();
        let before = report.signed_bytes();
        report.signature_s = [0x55; 48];
        assert_eq!(report.signed_bytes(), before);
        assert_eq!(before.len(), SIGNED_REGION);
    }

    #[test]
    fn test_rejects_wrong_size() {
        assert!(SnpReport::from_bytes(&[0u8; 100]).is_err());
        assert!(SnpReport::from_bytes(&vec![0u8; REPORT_SIZE + 1]).is_err());
    }

    #[test]
    fn test_rejects_oversized_signature_component() {
        let mut raw = SnpReport::default().to_bytes();
        raw[OFF_SIG_R + 60] = 1;
        assert!(SnpReport::from_bytes(&raw).is_err());
    }

    #[test]
    fn test_debug_bit() {
        let mut report = SnpReport::default();
        assert!(!report.debug_allowed());
        report.policy |= POLICY_DEBUG_BIT;
        assert!(report.debug_allowed());
    }
}
