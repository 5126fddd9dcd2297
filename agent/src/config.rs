//! Report issuer selection shared by the agent binaries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, ValueEnum};
use contrast_common::{
    ConfigfsTsmIssuer, HexString, LaunchParameters, PolicyDigest, ReportIssuer, SimulatedIssuer,
    SimulatedPlatform, VendorChain,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum IssuerKind {
    /// Linux configfs-tsm on SEV-SNP hardware.
    Configfs,
    /// Deterministic software platform. Not for production.
    Simulated,
}

#[derive(Args, Debug, Clone)]
pub struct IssuerArgs {
    /// Where attestation reports come from.
    #[arg(long, env = "CONTRAST_REPORT_ISSUER", value_enum, default_value = "configfs")]
    pub issuer: IssuerKind,
    /// PEM bundle with VCEK, ASK and ARK (configfs issuer).
    #[arg(long, env = "CONTRAST_VENDOR_CHAIN")]
    pub vendor_chain: Option<PathBuf>,
    /// Policy document the simulated VM was launched with.
    #[arg(long, env = "CONTRAST_SIMULATED_LAUNCH_POLICY")]
    pub simulated_launch_policy: Option<PathBuf>,
    /// Launch measurement as hex, 48 bytes (simulated issuer).
    #[arg(long, env = "CONTRAST_SIMULATED_MEASUREMENT")]
    pub simulated_measurement: Option<HexString>,
    /// Seed for the simulated vendor hierarchy.
    #[arg(
        long,
        env = "CONTRAST_SIMULATED_VENDOR_SEED",
        default_value = "contrast-simulated-vendor"
    )]
    pub simulated_vendor_seed: String,
}

impl IssuerArgs {
    pub fn build(&self) -> anyhow::Result<Arc<dyn ReportIssuer>> {
        match self.issuer {
            IssuerKind::Configfs => {
                let path = self
                    .vendor_chain
                    .as_ref()
                    .context("--vendor-chain is required with the configfs issuer")?;
                let bundle = std::fs::read_to_string(path)
                    .with_context(|| format!("reading vendor chain {}", path.display()))?;
                let chain = VendorChain::from_pem_bundle(&bundle)?;
                Ok(Arc::new(ConfigfsTsmIssuer::new(chain)?))
            }
            IssuerKind::Simulated => {
                tracing::warn!("SIMULATED ATTESTATION: reports carry no hardware guarantees");
                let platform = Arc::new(SimulatedPlatform::from_seed(
                    self.simulated_vendor_seed.as_bytes(),
                )?);
                let policy_path = self
                    .simulated_launch_policy
                    .as_ref()
                    .context("--simulated-launch-policy is required with the simulated issuer")?;
                let policy = std::fs::read(policy_path)
                    .with_context(|| format!("reading policy {}", policy_path.display()))?;
                let measurement: [u8; 48] = match &self.simulated_measurement {
                    Some(m) => match m.to_bytes().try_into() {
                        Ok(m) => m,
                        Err(_) => bail!("--simulated-measurement must be 48 bytes"),
                    },
                    None => bail!("--simulated-measurement is required with the simulated issuer"),
                };
                Ok(Arc::new(SimulatedIssuer::new(
                    platform,
                    LaunchParameters::new(measurement, *PolicyDigest::of(&policy).as_bytes()),
                )))
            }
        }
    }
}
