//! Sources of attestation reports.
//!
//! `ConfigfsTsmIssuer` asks the security processor through the Linux
//! configfs-tsm interface. `SimulatedIssuer` produces reports signed by a
//! `SimulatedPlatform` for tests and local deployments.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ContrastError, Result};
use crate::evidence::Evidence;
use crate::report::{SnpReport, HOST_DATA_SIZE, MEASUREMENT_SIZE, REPORT_DATA_SIZE};
use crate::vendor::{SimulatedPlatform, VendorChain};

/// Default configfs-tsm report directory.
pub const TSM_REPORT_PATH: &str = "/sys/kernel/config/tsm/report";

/// Counter for unique configfs-tsm entry names.
static TSM_ENTRY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Produces evidence whose report carries the given report data.
pub trait ReportIssuer: Send + Sync {
    fn issue(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> Result<Evidence>;
}

/// What the hypervisor measured and bound at VM launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParameters {
    pub measurement: [u8; MEASUREMENT_SIZE],
    /// Policy digest supplied by the orchestrator.
    pub host_data: [u8; HOST_DATA_SIZE],
    pub guest_policy: u64,
    pub vmpl: u32,
}

impl LaunchParameters {
    pub fn new(measurement: [u8; MEASUREMENT_SIZE], host_data: [u8; HOST_DATA_SIZE]) -> Self {
        Self {
            measurement,
            host_data,
            guest_policy: SnpReport::default().policy,
            vmpl: 0,
        }
    }
}

pub struct SimulatedIssuer {
    platform: Arc<SimulatedPlatform>,
    launch: LaunchParameters,
}

impl SimulatedIssuer {
    pub fn new(platform: Arc<SimulatedPlatform>, launch: LaunchParameters) -> Self {
        Self { platform, launch }
    }

    pub fn launch(&self) -> &LaunchParameters {
        &self.launch
    }

    /// Signed report without the evidence wrapper.
    pub fn report(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> SnpReport {
        let mut report = SnpReport {
            policy: self.launch.guest_policy,
            vmpl: self.launch.vmpl,
            report_data: *report_data,
            measurement: self.launch.measurement,
            host_data: self.launch.host_data,
            ..Default::default()
        };
        self.platform.sign_report(&mut report);
        report
    }
}

impl ReportIssuer for SimulatedIssuer {
    fn issue(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> Result<Evidence> {
        let report = self.report(report_data);
        Ok(Evidence::new(
            &report.to_bytes(),
            self.platform.vendor_chain().clone(),
        ))
    }
}

/// Hardware reports via `/sys/kernel/config/tsm/report`.
pub struct ConfigfsTsmIssuer {
    tsm_path: PathBuf,
    vendor_chain: VendorChain,
}

impl ConfigfsTsmIssuer {
    /// Use the default configfs-tsm path.
    pub fn new(vendor_chain: VendorChain) -> Result<Self> {
        Self::with_tsm_path(PathBuf::from(TSM_REPORT_PATH), vendor_chain)
    }

    pub fn with_tsm_path(tsm_path: PathBuf, vendor_chain: VendorChain) -> Result<Self> {
        if !tsm_path.exists() {
            return Err(ContrastError::ConfigurationError(format!(
                "configfs-tsm not available: {} does not exist",
                tsm_path.display()
            )));
        }
        Ok(Self {
            tsm_path,
            vendor_chain,
        })
    }

    fn request_report(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> Result<Vec<u8>> {
        use std::fs;

        let entry_name = format!(
            "contrast_{}_{}",
            std::process::id(),
            TSM_ENTRY_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let entry_path = self.tsm_path.join(entry_name);

        // Stale entry from an earlier process with the same pid.
        let _ = fs::remove_dir_all(&entry_path);

        fs::create_dir(&entry_path).map_err(|e| {
            ContrastError::IoError(format!(
                "failed to create tsm report entry {}: {}",
                entry_path.display(),
                e
            ))
        })?;

        let result = read_entry(&entry_path, report_data);
        let _ = fs::remove_dir(&entry_path);
        result
    }
}

fn read_entry(entry_path: &Path, report_data: &[u8; REPORT_DATA_SIZE]) -> Result<Vec<u8>> {
    use std::fs;

    fs::write(entry_path.join("inblob"), report_data)
        .map_err(|e| ContrastError::IoError(format!("failed to write inblob: {}", e)))?;

    let provider_path = entry_path.join("provider");
    if provider_path.exists() {
        let provider = fs::read_to_string(&provider_path)
            .map_err(|e| ContrastError::IoError(format!("failed to read provider: {}", e)))?;
        if provider.trim() != "sev_guest" {
            return Err(ContrastError::ConfigurationError(format!(
                "unsupported configfs-tsm provider {}",
                provider.trim()
            )));
        }
    }

    let outblob = fs::read(entry_path.join("outblob"))
        .map_err(|e| ContrastError::IoError(format!("failed to read outblob: {}", e)))?;

    // The first generation of the interface returns the report inside a
    // 32-byte MSG_REPORT_RSP header.
    match outblob.len() {
        crate::report::REPORT_SIZE => Ok(outblob),
        n if n == crate::report::REPORT_SIZE + 32 => Ok(outblob[32..].to_vec()),
        n => Err(ContrastError::InvalidInput(format!(
            "configfs-tsm returned {} bytes, expected an SNP report",
            n
        ))),
    }
}

impl ReportIssuer for ConfigfsTsmIssuer {
    fn issue(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> Result<Evidence> {
        let raw = self.request_report(report_data)?;
        // Decode once to fail early on garbage.
        SnpReport::from_bytes(&raw)?;
        Ok(Evidence::new(&raw, self.vendor_chain.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::{verify_chain, verify_report_signature};

    fn chain() -> VendorChain {
        VendorChain {
            ark: String::new(),
            ask: String::new(),
            vcek: String::new(),
        }
    }

    #[test]
    fn test_simulated_issuer_binds_launch_parameters() {
        let platform = Arc::new(SimulatedPlatform::from_seed(b"issuer-test").unwrap());
        let issuer = SimulatedIssuer::new(
            platform.clone(),
            LaunchParameters::new([0x42; 48], [0xab; 32]),
        );
        let evidence = issuer.issue(&[7u8; 64]).unwrap();
        let report = evidence.parse_report().unwrap();

        assert_eq!(report.measurement, [0x42; 48]);
        assert_eq!(report.host_data, [0xab; 32]);
        assert_eq!(report.report_data, [7u8; 64]);
        assert_eq!(report.reported_tcb, platform.tcb());

        let verified = verify_chain(&evidence.vendor_chain, &report.chip_id).unwrap();
        verify_report_signature(&report, &verified.vcek_public_key).unwrap();
    }

    #[test]
    fn test_configfs_missing_path() {
        let err = ConfigfsTsmIssuer::with_tsm_path(PathBuf::from("/nonexistent/tsm"), chain());
        assert!(matches!(err, Err(ContrastError::ConfigurationError(_))));
    }

    #[test]
    fn test_configfs_without_outblob_fails() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = ConfigfsTsmIssuer::with_tsm_path(dir.path().to_path_buf(), chain()).unwrap();
        let err = issuer.issue(&[0u8; 64]).unwrap_err();
        assert!(err.to_string().contains("outblob"));
    }
}
