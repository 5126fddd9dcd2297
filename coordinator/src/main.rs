use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use contrast_common::history::{FsStore, History};
use contrast_common::{
    ConfigfsTsmIssuer, HexString, LaunchParameters, PolicyDigest, ReportIssuer, SimulatedIssuer,
    SimulatedPlatform, VendorChain,
};
use contrast_coordinator::audit::AuditLog;
use contrast_coordinator::{Coordinator, CoordinatorConfig, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum IssuerKind {
    /// Linux configfs-tsm on SEV-SNP hardware.
    Configfs,
    /// Deterministic software platform. Not for production.
    Simulated,
}

#[derive(Parser)]
#[command(
    name = "contrast-coordinator",
    about = "Contrast Coordinator: verifies workload attestation and issues mesh certificates"
)]
struct Args {
    /// Listen address
    #[arg(long, env = "CONTRAST_LISTEN", default_value = "0.0.0.0:1313")]
    listen: String,
    /// Directory holding the manifest history and the audit log.
    #[arg(long, env = "CONTRAST_STATE_DIR", default_value = "/var/lib/contrast")]
    state_dir: PathBuf,
    /// Deadline for verifying one attestation, in seconds.
    #[arg(long, env = "CONTRAST_VERIFICATION_TIMEOUT", default_value = "10")]
    verification_timeout: u64,
    /// Maximum attestation requests per minute per IP. Set to 0 to disable.
    #[arg(long, env = "CONTRAST_RATE_LIMIT", default_value = "120")]
    rate_limit: u32,
    /// Where this Coordinator's own attestation reports come from.
    #[arg(long, env = "CONTRAST_REPORT_ISSUER", value_enum, default_value = "configfs")]
    issuer: IssuerKind,
    /// PEM bundle with VCEK, ASK and ARK (configfs issuer).
    #[arg(long, env = "CONTRAST_VENDOR_CHAIN")]
    vendor_chain: Option<PathBuf>,
    /// Policy document this Coordinator was launched with (simulated issuer).
    #[arg(long, env = "CONTRAST_POLICY")]
    policy: Option<PathBuf>,
    /// Launch measurement as hex, 48 bytes (simulated issuer).
    #[arg(long, env = "CONTRAST_SIMULATED_MEASUREMENT")]
    simulated_measurement: Option<HexString>,
    /// Seed for the simulated vendor hierarchy.
    #[arg(
        long,
        env = "CONTRAST_SIMULATED_VENDOR_SEED",
        default_value = "contrast-simulated-vendor"
    )]
    simulated_vendor_seed: String,
}

fn build_issuer(args: &Args) -> anyhow::Result<Arc<dyn ReportIssuer>> {
    match args.issuer {
        IssuerKind::Configfs => {
            let path = args
                .vendor_chain
                .as_ref()
                .context("--vendor-chain is required with the configfs issuer")?;
            let bundle = std::fs::read_to_string(path)
                .with_context(|| format!("reading vendor chain {}", path.display()))?;
            let chain = VendorChain::from_pem_bundle(&bundle)?;
            Ok(Arc::new(ConfigfsTsmIssuer::new(chain)?))
        }
        IssuerKind::Simulated => {
            tracing::warn!("========================================");
            tracing::warn!("  SIMULATED ATTESTATION (--issuer simulated)");
            tracing::warn!("  Reports carry no hardware guarantees.");
            tracing::warn!("========================================");
            let platform = Arc::new(SimulatedPlatform::from_seed(
                args.simulated_vendor_seed.as_bytes(),
            )?);
            let policy_path = args
                .policy
                .as_ref()
                .context("--policy is required with the simulated issuer")?;
            let policy = std::fs::read(policy_path)
                .with_context(|| format!("reading policy {}", policy_path.display()))?;
            let measurement: [u8; 48] = match &args.simulated_measurement {
                Some(m) => match m.to_bytes().try_into() {
                    Ok(m) => m,
                    Err(_) => bail!("--simulated-measurement must be 48 bytes"),
                },
                None => bail!("--simulated-measurement is required with the simulated issuer"),
            };
            let digest = PolicyDigest::of(&policy);
            tracing::info!(
                event = "simulated_platform",
                policy_digest = %digest,
                root_key_digest = %hex::encode(platform.root_key_digest())
            );
            Ok(Arc::new(SimulatedIssuer::new(
                platform,
                LaunchParameters::new(measurement, *digest.as_bytes()),
            )))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let issuer = build_issuer(&args)?;

    std::fs::create_dir_all(&args.state_dir)
        .with_context(|| format!("creating state directory {}", args.state_dir.display()))?;
    let history = History::new(Box::new(FsStore::new(args.state_dir.join("history"))?));
    let audit = AuditLog::with_file(args.state_dir.join("audit.jsonl"));
    let config = CoordinatorConfig {
        verification_timeout: Duration::from_secs(args.verification_timeout),
        ..Default::default()
    };
    let coordinator = Arc::new(Coordinator::new(history, issuer, audit, config)?);

    if args.rate_limit == 0 {
        tracing::warn!("Rate limiting is disabled (--rate-limit 0)");
    } else {
        tracing::info!("Rate limit: {} requests/minute per IP", args.rate_limit);
    }

    let app = contrast_coordinator::build_router_with_config(
        coordinator,
        &ServerConfig {
            requests_per_minute: args.rate_limit,
        },
    );

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tracing::info!("Contrast Coordinator listening on {}", args.listen);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("server error")?;
    Ok(())
}
