use std::sync::Arc;

use contrast_agent::initializer::{
    Initializer, CERT_FILE, KEY_FILE, MESH_CA_FILE, ROOT_CA_FILE, SECRET_FILE,
};
use contrast_agent::server::{build_router, AgentHealth, Decision, REQUEST_PATH};
use contrast_agent::{AgentError, AgentRequest, AgentState, CreateContainer};
use contrast_common::api::{SetManifestRequest, MANIFEST_PATH};
use contrast_common::ca::{inspect_workload_cert, verify_issued_by};
use contrast_common::history::History;
use contrast_common::testing::{policy_bytes, TestDeployment};
use contrast_common::PolicyDigest;
use contrast_coordinator::audit::AuditLog;
use contrast_coordinator::{Coordinator, CoordinatorConfig};
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::SigningKey;

const VENDOR_SEED: &[u8] = b"agent-test-vendor";

async fn serve(app: axum::Router) -> String {
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
    format!("http://{}", addr)
}

fn web_container() -> AgentRequest {
    AgentRequest::CreateContainer(CreateContainer {
        name: "web".to_string(),
        image: format!("registry.example/web@sha256:{}", hex::encode([0xAB; 32])),
        command: vec!["/bin/server".to_string()],
        env: vec!["PATH=/usr/bin".to_string()],
        mounts: vec![],
    })
}

async fn submit(client: &reqwest::Client, base: &str, request: &AgentRequest) -> (u16, Decision) {
    let resp = client
        .post(format!("{}{}", base, REQUEST_PATH))
        .json(request)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn test_agent_enforces_verified_policy() {
    let deploy = TestDeployment::new(VENDOR_SEED);
    let policy = policy_bytes("web", 0xAB);
    let state = AgentState::start(policy.clone(), &deploy.issuer(&policy));
    let base = serve(build_router(Arc::new(state))).await;
    let client = reqwest::Client::new();

    let health: AgentHealth = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(health.enforcing);
    assert_eq!(
        health.policy_digest.as_deref(),
        Some(PolicyDigest::of(&policy).to_string().as_str())
    );

    let (status, decision) = submit(&client, &base, &web_container()).await;
    assert_eq!(status, 200);
    assert!(decision.allowed);

    let shell = AgentRequest::ExecProcess {
        container: "web".to_string(),
        command: vec!["/bin/sh".to_string()],
    };
    let (status, decision) = submit(&client, &base, &shell).await;
    assert_eq!(status, 403);
    assert!(!decision.allowed);
    assert_eq!(decision.rule.as_deref(), Some("exec"));
}

#[tokio::test]
async fn test_agent_with_rejected_policy_denies_everything() {
    let deploy = TestDeployment::new(VENDOR_SEED);
    let launched = policy_bytes("web", 0xAB);
    // The runtime hands over a different document than the VM was launched with.
    let substituted = policy_bytes("web", 0xAC);
    let state = AgentState::start(substituted, &deploy.issuer(&launched));
    assert!(!state.is_enforcing());

    let base = serve(build_router(Arc::new(state))).await;
    let client = reqwest::Client::new();
    let (status, decision) = submit(&client, &base, &web_container()).await;
    assert_eq!(status, 403);
    assert_eq!(decision.rule.as_deref(), Some("policy"));
}

async fn coordinator_with_manifest(
    deploy: &TestDeployment,
    workloads: &[(&[u8], &str)],
) -> String {
    let coordinator = Arc::new(
        Coordinator::new(
            History::in_memory(),
            Arc::new(deploy.coordinator_issuer()),
            AuditLog::in_memory(),
            CoordinatorConfig::default(),
        )
        .unwrap(),
    );
    let base = serve(contrast_coordinator::build_router(coordinator)).await;
    let resp = reqwest::Client::new()
        .post(format!("{}{}", base, MANIFEST_PATH))
        .json(&SetManifestRequest {
            manifest: deploy.manifest(workloads),
            previous_manifest_hash: None,
            authorization: None,
        })
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    base
}

#[tokio::test]
async fn test_initializer_writes_bundle() {
    let deploy = TestDeployment::new(VENDOR_SEED);
    let web = policy_bytes("web", 0xAB);
    let base = coordinator_with_manifest(&deploy, &[(&web, "web")]).await;
    let dir = tempfile::tempdir().unwrap();

    let initializer = Initializer::new(&base, Arc::new(deploy.issuer(&web))).unwrap();
    let bundle = initializer.run(dir.path()).await.unwrap();
    assert_eq!(bundle.generation, 1);
    assert!(bundle.has_secret);

    let cert = std::fs::read_to_string(dir.path().join(CERT_FILE)).unwrap();
    let mesh_ca = std::fs::read_to_string(dir.path().join(MESH_CA_FILE)).unwrap();
    let root_ca = std::fs::read_to_string(dir.path().join(ROOT_CA_FILE)).unwrap();
    verify_issued_by(&cert, &mesh_ca).unwrap();
    verify_issued_by(&mesh_ca, &root_ca).unwrap();

    let identity = inspect_workload_cert(&cert).unwrap();
    assert_eq!(identity.sans, vec!["web".to_string()]);
    assert_eq!(&identity.policy_digest, PolicyDigest::of(&web).as_bytes());

    // The stored key is the one the certificate was issued for.
    let key_pem = std::fs::read_to_string(dir.path().join(KEY_FILE)).unwrap();
    let key = SigningKey::from_pkcs8_pem(&key_pem).unwrap();
    assert_eq!(identity.public_key, key.verifying_key().to_bytes().to_vec());

    assert_eq!(std::fs::read(dir.path().join(SECRET_FILE)).unwrap().len(), 32);

    // Another instance of the same workload gets the same secret.
    let other = tempfile::tempdir().unwrap();
    initializer.run(other.path()).await.unwrap();
    assert_eq!(
        std::fs::read(dir.path().join(SECRET_FILE)).unwrap(),
        std::fs::read(other.path().join(SECRET_FILE)).unwrap()
    );
}

#[tokio::test]
async fn test_initializer_with_unknown_policy_gets_nothing() {
    let deploy = TestDeployment::new(VENDOR_SEED);
    let web = policy_bytes("web", 0xAB);
    let base = coordinator_with_manifest(&deploy, &[(&web, "web")]).await;
    let dir = tempfile::tempdir().unwrap();

    let rogue = policy_bytes("web", 0xEF);
    let err = Initializer::new(&base, Arc::new(deploy.issuer(&rogue)))
        .unwrap()
        .run(dir.path())
        .await
        .unwrap_err();
    match err {
        AgentError::Coordinator { status, message } => {
            assert_eq!(status, 403);
            assert!(message.contains("unknown_policy_digest"), "{}", message);
        }
        other => panic!("unexpected error {}", other),
    }
    assert!(!dir.path().join(CERT_FILE).exists());
}
