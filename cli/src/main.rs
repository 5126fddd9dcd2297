//! Contrast CLI.
//!
//! Usage:
//!   contrast generate --reference-values rv.json deployment/
//!   contrast set --coordinator 10.0.0.1:1313
//!   contrast verify --coordinator 10.0.0.1:1313
//!   contrast recover --coordinator 10.0.0.1:1313
//!
//! Exit code 0 = success, 1 = Coordinator failed verification, 2 = error

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use contrast_cli::generate::generate;
use contrast_cli::recover::recover;
use contrast_cli::set::set_manifest;
use contrast_cli::ui::{Ui, UiConfig};
use contrast_cli::verify::{verify_coordinator, write_verified};
use contrast_cli::workspace::{load_manifest, VERIFY_DIR};
use contrast_cli::{CliError, CoordinatorClient, Workspace, EXIT_ERROR};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "contrast", version, about = "Deploy and verify confidential workloads")]
struct Args {
    /// Directory holding the manifest, owner keys and seed shares.
    #[arg(long, global = true, env = "CONTRAST_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    /// Output format: text or json
    #[arg(long, global = true, default_value = "text")]
    format: String,

    /// Plain text output without color.
    #[arg(long, global = true)]
    plain: bool,

    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate policies for workload descriptors and a manifest permitting them.
    Generate {
        /// Directory of Kubernetes YAML descriptors, annotated in place.
        descriptors: PathBuf,
        /// Reference values JSON (`{"snp": [...]}`).
        #[arg(long, env = "CONTRAST_REFERENCE_VALUES")]
        reference_values: PathBuf,
    },
    /// Set the workspace manifest on the Coordinator.
    Set {
        #[arg(long, env = "CONTRAST_COORDINATOR")]
        coordinator: String,
        /// Manifest to set instead of the workspace one.
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Verify that the Coordinator enforces the expected manifest.
    Verify {
        #[arg(long, env = "CONTRAST_COORDINATOR")]
        coordinator: String,
        /// Expected manifest instead of the workspace one.
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Where to write the verified CAs and history (default: <workspace>/verify).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Recover a restarted Coordinator with the workspace seed share.
    Recover {
        #[arg(long, env = "CONTRAST_COORDINATOR")]
        coordinator: String,
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args = Args::parse();
    let json = args.format == "json";
    let config = UiConfig::resolve(
        std::io::stdout().is_terminal(),
        args.plain,
        args.no_color,
        json,
    );
    let mut ui = Ui::stdout(config);

    match run(args, &mut ui).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = match e.downcast_ref::<CliError>() {
                Some(CliError::Untrusted(report)) => {
                    if json {
                        if let Ok(out) = serde_json::to_string_pretty(report) {
                            println!("{}", out);
                        }
                    } else {
                        ui.verify_report(report);
                    }
                    contrast_cli::EXIT_UNTRUSTED
                }
                Some(cli) => {
                    eprintln!("error: {:#}", e);
                    cli.exit_code()
                }
                None => {
                    eprintln!("error: {:#}", e);
                    EXIT_ERROR
                }
            };
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args, ui: &mut Ui) -> anyhow::Result<()> {
    let workspace = Workspace::new(&args.workspace);
    let json = args.format == "json";
    let manifest_for = |path: &Option<PathBuf>| match path {
        Some(path) => load_manifest(path),
        None => workspace.load_manifest(),
    };

    match &args.command {
        Command::Generate {
            descriptors,
            reference_values,
        } => {
            let generated = generate(descriptors, reference_values, &workspace)
                .context("policy generation failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&generated.manifest)?);
                return Ok(());
            }
            ui.header("Contrast Policy Generation");
            for workload in &generated.workloads {
                ui.kv(
                    &format!("{}/{}", workload.kind, workload.name),
                    workload.digest.as_str(),
                );
            }
            ui.blank();
            ui.success(&format!(
                "Manifest written to {}",
                workspace.path(contrast_cli::workspace::MANIFEST_FILE).display()
            ));
        }
        Command::Set {
            coordinator,
            manifest,
        } => {
            let manifest = manifest_for(manifest)?;
            let client = CoordinatorClient::new(coordinator)?;
            let outcome = set_manifest(&client, &workspace, &manifest).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.response)?);
                return Ok(());
            }
            ui.verify_report(&outcome.report);
            ui.kv("Generation", &outcome.response.generation.to_string());
            ui.kv("Manifest", outcome.response.manifest_hash.as_str());
            if outcome.response.seed_shares.is_some() {
                ui.warn("Seed shares saved to the workspace. Back them up with the seed-share owner key.");
            }
            ui.success(if outcome.update {
                "Manifest updated"
            } else {
                "Manifest set"
            });
        }
        Command::Verify {
            coordinator,
            manifest,
            output,
        } => {
            let manifest = manifest_for(manifest)?;
            let client = CoordinatorClient::new(coordinator)?;
            let verified = verify_coordinator(&client, &manifest).await?;
            let dir = output
                .clone()
                .unwrap_or_else(|| workspace.path(VERIFY_DIR));
            write_verified(&dir, &verified.history)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&verified.report)?);
                return Ok(());
            }
            ui.verify_report(&verified.report);
            ui.info(&format!("Verified CAs and history written to {}", dir.display()));
        }
        Command::Recover {
            coordinator,
            manifest,
        } => {
            let manifest = manifest_for(manifest)?;
            let client = CoordinatorClient::new(coordinator)?;
            let response = recover(&client, &workspace, &manifest).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            ui.kv("Phase", &response.phase);
            ui.kv("Generation", &response.generation.to_string());
            ui.success("Coordinator recovered");
        }
    }
    Ok(())
}
