use std::path::Path;
use std::sync::Arc;

use contrast_cli::generate::generate;
use contrast_cli::recover::recover;
use contrast_cli::set::set_manifest;
use contrast_cli::verify::{verify_coordinator, write_verified, CheckStatus};
use contrast_cli::workspace::{SEEDSHARE_OWNER_KEY_FILE, SEED_SHARES_FILE};
use contrast_cli::{CliError, CoordinatorClient, Workspace, EXIT_UNTRUSTED};
use contrast_common::ca::verify_issued_by;
use contrast_common::history::{FsStore, History};
use contrast_common::manifest::ReferenceValues;
use contrast_common::testing::{TestDeployment, TEST_MEASUREMENT};
use contrast_common::{HexString, LaunchParameters, Role, SimulatedIssuer};
use contrast_coordinator::audit::AuditLog;
use contrast_coordinator::{Coordinator, CoordinatorConfig};
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;

const VENDOR_SEED: &[u8] = b"cli-test-vendor";

const COORDINATOR_YAML: &str = r#"apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: coordinator
  annotations:
    contrast.io/role: coordinator
spec:
  template:
    spec:
      containers:
        - name: coordinator
          image: ghcr.io/edgeless/coordinator@sha256:c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0
          command: ["/bin/coordinator"]
"#;

const WEB_YAML: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  template:
    spec:
      containers:
        - name: web
          image: registry.example/web@sha256:abababababababababababababababababababababababababababababababab
          command: ["/bin/server"]
"#;

const DB_YAML: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: db
spec:
  containers:
    - name: db
      image: registry.example/db@sha256:dbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdbdb
"#;

/// Workspace with descriptors, reference values and a seed-share owner key.
/// The key is 2048 bits to keep the test fast; `generate` keeps an existing key.
struct Fixture {
    _dir: tempfile::TempDir,
    descriptors: std::path::PathBuf,
    reference_values: std::path::PathBuf,
    workspace: Workspace,
}

fn fixture(deploy: &TestDeployment) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let descriptors = dir.path().join("deployment");
    std::fs::create_dir_all(&descriptors).unwrap();
    std::fs::write(descriptors.join("coordinator.yml"), COORDINATOR_YAML).unwrap();
    std::fs::write(descriptors.join("web.yaml"), WEB_YAML).unwrap();
    std::fs::write(descriptors.join("README.md"), "not a descriptor").unwrap();

    let reference_values = dir.path().join("reference-values.json");
    let rv = ReferenceValues {
        snp: vec![deploy.reference_values()],
    };
    std::fs::write(&reference_values, serde_json::to_vec(&rv).unwrap()).unwrap();

    let workspace = Workspace::new(dir.path().join("workspace"));
    workspace.create().unwrap();
    let seed_owner = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
    std::fs::write(
        workspace.path(SEEDSHARE_OWNER_KEY_FILE),
        seed_owner.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes(),
    )
    .unwrap();

    Fixture {
        _dir: dir,
        descriptors,
        reference_values,
        workspace,
    }
}

/// Issuer for the Coordinator VM launched with the generated policy.
fn coordinator_issuer(deploy: &TestDeployment, digest: &HexString) -> SimulatedIssuer {
    SimulatedIssuer::new(
        deploy.platform.clone(),
        LaunchParameters::new(TEST_MEASUREMENT, digest.to_bytes().try_into().unwrap()),
    )
}

async fn start_coordinator(issuer: SimulatedIssuer, history: History) -> CoordinatorClient {
    let coordinator = Arc::new(
        Coordinator::new(
            history,
            Arc::new(issuer),
            AuditLog::in_memory(),
            CoordinatorConfig::default(),
        )
        .unwrap(),
    );
    let app = contrast_coordinator::build_router(coordinator);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .unwrap();
    });
    CoordinatorClient::new(&addr.to_string()).unwrap()
}

fn untrusted(err: CliError) -> Box<contrast_cli::VerifyReport> {
    assert_eq!(err.exit_code(), EXIT_UNTRUSTED);
    match err {
        CliError::Untrusted(report) => report,
        other => panic!("expected untrusted, got {}", other),
    }
}

fn coordinator_digest(generated: &contrast_cli::generate::Generated) -> HexString {
    generated
        .workloads
        .iter()
        .find(|w| w.entry.role == Role::Coordinator)
        .unwrap()
        .digest
        .clone()
}

fn pem_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .unwrap()
        .matches("BEGIN CERTIFICATE")
        .count()
}

#[tokio::test]
async fn test_generate_set_verify_update() {
    let deploy = TestDeployment::new(VENDOR_SEED);
    let fx = fixture(&deploy);

    let generated = generate(&fx.descriptors, &fx.reference_values, &fx.workspace).unwrap();
    assert_eq!(generated.workloads.len(), 2);
    assert_eq!(generated.manifest.policies.len(), 2);
    assert_eq!(generated.manifest.workload_owner_key_digests.len(), 1);
    assert_eq!(generated.manifest.seedshare_owner_pub_keys.len(), 1);
    let annotated = std::fs::read_to_string(fx.descriptors.join("web.yaml")).unwrap();
    assert!(annotated.contains("contrast.io/policy-digest"));

    let client = start_coordinator(
        coordinator_issuer(&deploy, &coordinator_digest(&generated)),
        History::in_memory(),
    )
    .await;

    let manifest = fx.workspace.load_manifest().unwrap();
    let first = set_manifest(&client, &fx.workspace, &manifest).await.unwrap();
    assert!(!first.update);
    assert_eq!(first.response.generation, 1);
    assert!(fx.workspace.path(SEED_SHARES_FILE).exists());

    let verified = verify_coordinator(&client, &manifest).await.unwrap();
    assert!(verified.report.verified);
    assert_eq!(verified.report.status("history"), CheckStatus::Pass);
    let out = fx.workspace.path("verify");
    write_verified(&out, &verified.history).unwrap();
    assert_eq!(pem_count(&out.join("coordinator-root-ca.pem")), 1);
    assert!(out.join("manifests/manifest.0.json").exists());

    // Verification is repeatable with fresh nonces.
    assert!(verify_coordinator(&client, &manifest).await.unwrap().report.verified);

    // Add a workload and update, signed with the workspace owner key.
    std::fs::write(fx.descriptors.join("db.yml"), DB_YAML).unwrap();
    let regenerated = generate(&fx.descriptors, &fx.reference_values, &fx.workspace).unwrap();
    assert_eq!(regenerated.manifest.policies.len(), 3);
    let second = set_manifest(&client, &fx.workspace, &regenerated.manifest)
        .await
        .unwrap();
    assert!(second.update);
    assert_eq!(second.response.generation, 2);
    assert!(second.response.seed_shares.is_none());
    verify_issued_by(&second.response.mesh_ca, &first.response.root_ca).unwrap();

    let after = verify_coordinator(&client, &regenerated.manifest).await.unwrap();
    assert_eq!(after.history.manifests.len(), 2);

    // The superseded manifest no longer verifies.
    let report = untrusted(verify_coordinator(&client, &manifest).await.err().unwrap());
    assert_eq!(report.status("manifest"), CheckStatus::Fail);
    assert_eq!(report.status("report_signature"), CheckStatus::Pass);
}

#[tokio::test]
async fn test_wrong_hardware_root_is_untrusted() {
    let deploy = TestDeployment::new(VENDOR_SEED);
    let fx = fixture(&deploy);
    let generated = generate(&fx.descriptors, &fx.reference_values, &fx.workspace).unwrap();

    // Same policy, different vendor hierarchy.
    let rogue = TestDeployment::new(b"rogue-vendor");
    let client = start_coordinator(
        coordinator_issuer(&rogue, &coordinator_digest(&generated)),
        History::in_memory(),
    )
    .await;

    let err = set_manifest(&client, &fx.workspace, &generated.manifest)
        .await
        .err()
        .unwrap();
    let report = untrusted(err);
    assert_eq!(report.status("vendor_chain"), CheckStatus::Fail);
    assert!(!fx.workspace.path(SEED_SHARES_FILE).exists());
}

#[tokio::test]
async fn test_unexpected_coordinator_policy_is_untrusted() {
    let deploy = TestDeployment::new(VENDOR_SEED);
    let fx = fixture(&deploy);
    let generated = generate(&fx.descriptors, &fx.reference_values, &fx.workspace).unwrap();

    let client = start_coordinator(deploy.coordinator_issuer(), History::in_memory()).await;
    let report = untrusted(
        set_manifest(&client, &fx.workspace, &generated.manifest)
            .await
            .err()
            .unwrap(),
    );
    assert_eq!(report.status("vendor_chain"), CheckStatus::Pass);
    assert_eq!(report.status("coordinator_policy"), CheckStatus::Fail);
}

#[tokio::test]
async fn test_update_requires_workload_owner() {
    let deploy = TestDeployment::new(VENDOR_SEED);
    let fx = fixture(&deploy);
    let generated = generate(&fx.descriptors, &fx.reference_values, &fx.workspace).unwrap();
    let client = start_coordinator(
        coordinator_issuer(&deploy, &coordinator_digest(&generated)),
        History::in_memory(),
    )
    .await;
    set_manifest(&client, &fx.workspace, &generated.manifest)
        .await
        .unwrap();

    // Another operator's workspace with its own owner key.
    let stranger = tempfile::tempdir().unwrap();
    let other = Workspace::new(stranger.path());
    other.workload_owner_key_or_create().unwrap();
    let mut changed = generated.manifest.clone();
    changed.workload_owner_key_digests.clear();

    match set_manifest(&client, &other, &changed).await {
        Err(CliError::Api { status, body }) => {
            assert_eq!(status, 401);
            assert_eq!(body.kind, "unauthorized");
        }
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("update without owner key accepted"),
    }
}

#[tokio::test]
async fn test_recover_after_restart() {
    let deploy = TestDeployment::new(VENDOR_SEED);
    let fx = fixture(&deploy);
    let state = tempfile::tempdir().unwrap();
    let generated = generate(&fx.descriptors, &fx.reference_values, &fx.workspace).unwrap();
    let digest = coordinator_digest(&generated);

    let first = start_coordinator(
        coordinator_issuer(&deploy, &digest),
        History::new(Box::new(FsStore::new(state.path()).unwrap())),
    )
    .await;
    set_manifest(&first, &fx.workspace, &generated.manifest)
        .await
        .unwrap();

    let restarted = start_coordinator(
        coordinator_issuer(&deploy, &digest),
        History::new(Box::new(FsStore::new(state.path()).unwrap())),
    )
    .await;
    let report = untrusted(
        verify_coordinator(&restarted, &generated.manifest)
            .await
            .err()
            .unwrap(),
    );
    assert_eq!(report.phase, "unrecovered");
    assert_eq!(report.status("phase"), CheckStatus::Fail);

    let recovered = recover(&restarted, &fx.workspace, &generated.manifest)
        .await
        .unwrap();
    assert_eq!(recovered.phase, "serving");
    assert_eq!(recovered.generation, 1);

    assert!(verify_coordinator(&restarted, &generated.manifest)
        .await
        .unwrap()
        .report
        .verified);

    // Recovering a Coordinator that is not waiting for it fails attestation.
    let again = recover(&restarted, &fx.workspace, &generated.manifest)
        .await
        .err()
        .unwrap();
    assert_eq!(untrusted(again).status("phase"), CheckStatus::Fail);
}
