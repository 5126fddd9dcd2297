//! HTTP client for the Coordinator API.

use std::time::Duration;

use contrast_common::api::{
    CoordinatorAttestation, ErrorResponse, HealthResponse, ManifestsResponse, RecoverRequest,
    RecoverResponse, SetManifestRequest, SetManifestResponse, ATTESTATION_PATH, MANIFESTS_PATH,
    MANIFEST_PATH, RECOVER_PATH,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CliError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl CoordinatorClient {
    /// `endpoint` is either a URL or `host:port` (plain HTTP).
    pub fn new(endpoint: &str) -> Result<Self> {
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CliError::Transport {
                url: base_url.clone(),
                source: e,
            })?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("/health").await
    }

    pub async fn attestation(&self, nonce: &[u8]) -> Result<CoordinatorAttestation> {
        self.get(&format!("{}?nonce={}", ATTESTATION_PATH, hex::encode(nonce)))
            .await
    }

    pub async fn manifests(&self) -> Result<ManifestsResponse> {
        self.get(MANIFESTS_PATH).await
    }

    pub async fn set_manifest(&self, request: &SetManifestRequest) -> Result<SetManifestResponse> {
        self.post(MANIFEST_PATH, request).await
    }

    pub async fn recover(&self, request: &RecoverRequest) -> Result<RecoverResponse> {
        self.post(RECOVER_PATH, request).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CliError::Transport {
                url: url.clone(),
                source: e,
            })?;
        decode(url, resp).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| CliError::Transport {
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
            .map_err(|e| CliError::Transport { url, source: e });
    }
    let text = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorResponse>(&text).unwrap_or_else(|_| ErrorResponse {
        error: text,
        code: 0,
        kind: "http".to_string(),
        field: None,
        expected: None,
        observed: None,
    });
    tracing::debug!(status = status.as_u16(), kind = %body.kind, "coordinator error");
    Err(CliError::Api {
        status: status.as_u16(),
        body,
    })
}
