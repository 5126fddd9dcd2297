//! Guest agent: verifies its policy against the hardware report and then
//! answers allow/deny for every privileged request from the host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use contrast_agent::config::IssuerArgs;
use contrast_agent::AgentState;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "contrast-agent",
    about = "Contrast guest agent: enforces the pod's policy document"
)]
struct Args {
    /// Listen address for host requests.
    #[arg(long, env = "CONTRAST_AGENT_LISTEN", default_value = "127.0.0.1:1340")]
    listen: String,
    /// Policy document handed to the VM by the runtime.
    #[arg(long, env = "CONTRAST_POLICY")]
    policy: PathBuf,
    #[command(flatten)]
    issuer: IssuerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let issuer = args.issuer.build()?;
    let document = std::fs::read(&args.policy)
        .with_context(|| format!("reading policy {}", args.policy.display()))?;

    // A rejected policy is not fatal: the agent keeps running and denies
    // every request.
    let state = {
        let issuer = issuer.clone();
        tokio::task::spawn_blocking(move || AgentState::start(document, issuer.as_ref()))
            .await
            .context("policy activation task failed")?
    };
    if let AgentState::Failed(failed) = &state {
        tracing::error!("Policy rejected, denying all requests: {}", failed.reason());
    }

    let app = contrast_agent::server::build_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tracing::info!("Contrast agent listening on {}", args.listen);
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
