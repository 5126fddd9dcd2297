//! Workload initializer: runs before the workload containers, attests to
//! the Coordinator and writes the certificate bundle to a shared directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use contrast_agent::config::IssuerArgs;
use contrast_agent::initializer::Initializer;
use contrast_agent::AgentError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "contrast-initializer",
    about = "Attest the workload to the Coordinator and store its certificates"
)]
struct Args {
    /// Coordinator address, `host:port` or URL.
    #[arg(long, env = "CONTRAST_COORDINATOR")]
    coordinator: String,
    /// Directory shared with the workload containers.
    #[arg(long, env = "CONTRAST_TLS_DIR", default_value = "/contrast/tls-config")]
    output_dir: PathBuf,
    /// Attempts before giving up while the Coordinator is unreachable or not ready.
    #[arg(long, env = "CONTRAST_INITIALIZER_ATTEMPTS", default_value = "30")]
    attempts: u32,
    #[command(flatten)]
    issuer: IssuerArgs,
}

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// The Coordinator may still be starting, waiting for a manifest or for recovery.
fn retryable(err: &AgentError) -> bool {
    match err {
        AgentError::Transport { .. } => true,
        AgentError::Coordinator { status, .. } => matches!(status, 409 | 429 | 503 | 504),
        _ => false,
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

    let initializer = Initializer::new(&args.coordinator, args.issuer.build()?)?;
    let mut attempt = 1;
    loop {
        match initializer.run(&args.output_dir).await {
            Ok(bundle) => {
                tracing::info!(
                    "Attested to {} (manifest generation {})",
                    args.coordinator,
                    bundle.generation
                );
                return Ok(());
            }
            Err(e) if retryable(&e) && attempt < args.attempts => {
                tracing::warn!(attempt, error = %e, "attestation not possible yet, retrying");
                attempt += 1;
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(e).context("attestation to the Coordinator failed"),
        }
    }
}
