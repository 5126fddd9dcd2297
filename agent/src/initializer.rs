//! Workload initializer: attests to the Coordinator from inside the VM and
//! stores the returned certificate bundle for the workload containers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use contrast_common::api::{
    AttestRequest, AttestResponse, ErrorResponse, NonceResponse, ATTEST_PATH, NONCE_PATH,
};
use contrast_common::transport::{TransportKeyPair, WORKLOAD_SECRET_INFO};
use contrast_common::{workload_report_data, ContrastError, HexString, ReportIssuer};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use crate::error::{AgentError, Result};

pub const KEY_FILE: &str = "key.pem";
pub const CERT_FILE: &str = "cert.pem";
pub const MESH_CA_FILE: &str = "mesh-ca.pem";
pub const ROOT_CA_FILE: &str = "coordinator-root-ca.pem";
pub const SECRET_FILE: &str = "secret";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What the initializer received and wrote.
#[derive(Debug)]
pub struct Bundle {
    pub certificate: String,
    pub mesh_ca: String,
    pub root_ca: String,
    pub generation: u64,
    pub manifest_hash: HexString,
    pub has_secret: bool,
}

pub struct Initializer {
    base_url: String,
    http: reqwest::Client,
    issuer: Arc<dyn ReportIssuer>,
}

impl Initializer {
    pub fn new(coordinator: &str, issuer: Arc<dyn ReportIssuer>) -> Result<Self> {
        let base_url = if coordinator.contains("://") {
            coordinator.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", coordinator.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Transport {
                url: base_url.clone(),
                source: e,
            })?;
        Ok(Self {
            base_url,
            http,
            issuer,
        })
    }

    /// Attest once and write the bundle to `dir`.
    pub async fn run(&self, dir: &Path) -> Result<Bundle> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let transport = TransportKeyPair::generate();
        let public_key = signing_key.verifying_key().to_bytes();
        let secret_key = transport.public_key();

        let nonce: NonceResponse = self.get(NONCE_PATH).await?;
        let report_data = workload_report_data(&nonce.nonce.to_bytes(), &public_key, &secret_key);

        let issuer = self.issuer.clone();
        let evidence = tokio::task::spawn_blocking(move || issuer.issue(&report_data))
            .await
            .map_err(|e| ContrastError::Internal(format!("report task failed: {}", e)))??;

        let response: AttestResponse = self
            .post(
                ATTEST_PATH,
                &AttestRequest {
                    evidence,
                    nonce: nonce.nonce,
                    public_key: HexString::from_bytes(&public_key),
                    secret_key: HexString::from_bytes(&secret_key),
                },
            )
            .await?;

        let secret = match &response.workload_secret {
            Some(sealed) => Some(Zeroizing::new(
                transport.open(WORKLOAD_SECRET_INFO, &sealed.to_bytes())?,
            )),
            None => None,
        };

        std::fs::create_dir_all(dir).map_err(|e| io(dir, e))?;
        let key_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ContrastError::Internal(format!("encoding key: {}", e)))?;
        write_private(&dir.join(KEY_FILE), key_pem.as_bytes())?;
        write(&dir.join(CERT_FILE), response.certificate.as_bytes())?;
        write(&dir.join(MESH_CA_FILE), response.mesh_ca.as_bytes())?;
        write(&dir.join(ROOT_CA_FILE), response.root_ca.as_bytes())?;
        if let Some(secret) = &secret {
            write_private(&dir.join(SECRET_FILE), secret)?;
        }

        tracing::info!(
            event = "workload_attested",
            generation = response.generation,
            manifest_hash = %response.manifest_hash,
            secret = secret.is_some(),
            dir = %dir.display()
        );
        Ok(Bundle {
            certificate: response.certificate,
            mesh_ca: response.mesh_ca,
            root_ca: response.root_ca,
            generation: response.generation,
            manifest_hash: response.manifest_hash,
            has_secret: secret.is_some(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).send().await.map_err(|e| AgentError::Transport {
            url: url.clone(),
            source: e,
        })?;
        decode(url, resp).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Transport {
                url: url.clone(),
                source: e,
            })?;
        decode(url, resp).await
    }
}

async fn decode<T: DeserializeOwned>(url: String, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .map_err(|e| AgentError::Transport { url, source: e });
    }
    let text = resp.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => format!("{} ({})", body.error, body.kind),
        Err(_) => text,
    };
    Err(AgentError::Coordinator {
        status: status.as_u16(),
        message,
    })
}

fn io(path: &Path, source: std::io::Error) -> AgentError {
    AgentError::Io {
        path: PathBuf::from(path),
        source,
    }
}

fn write(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| io(path, e))
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| io(path, e))?;
    }
    Ok(())
}
