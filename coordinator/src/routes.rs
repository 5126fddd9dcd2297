use axum::extract::{Query, State};
use axum::response::Json;
use contrast_common::api::{
    AttestRequest, AttestResponse, AttestationQuery, CoordinatorAttestation, HealthResponse,
    ManifestsResponse, NonceResponse, RecoverRequest, RecoverResponse, SetManifestRequest,
    SetManifestResponse,
};
use contrast_common::HexString;

use crate::api_types::{bad_request, ApiError, ApiJson};
use crate::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// `GET /health`: liveness check with the current phase.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let audit_sink_failures = state.coordinator.audit().sink_failures();
    let status = if audit_sink_failures == 0 { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        phase: state.coordinator.phase().await.name().to_string(),
        version: contrast_common::VERSION.to_string(),
        audit_sink_failures,
    })
}

/// `GET /api/v1/nonce`: single-use challenge for workload attestation.
pub async fn nonce(State(state): State<AppState>) -> ApiResult<NonceResponse> {
    let nonce = state.coordinator.issue_nonce().await?;
    Ok(Json(NonceResponse {
        nonce: HexString::from_bytes(&nonce),
        expires_in_secs: state.coordinator.nonces().validity().as_secs(),
    }))
}

/// `POST /api/v1/attest`: verify workload evidence, return its certificates.
pub async fn attest(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<AttestRequest>,
) -> ApiResult<AttestResponse> {
    Ok(Json(state.coordinator.attest(body).await?))
}

/// `GET /api/v1/attestation?nonce=<hex>`: the Coordinator's own evidence.
pub async fn attestation(
    State(state): State<AppState>,
    query: Result<Query<AttestationQuery>, axum::extract::rejection::QueryRejection>,
) -> ApiResult<CoordinatorAttestation> {
    let Query(query) = query.map_err(|e| bad_request(format!("invalid nonce: {}", e)))?;
    Ok(Json(
        state
            .coordinator
            .attestation(&query.nonce.to_bytes())
            .await?,
    ))
}

/// `GET /api/v1/manifests`: manifest history and current CA certificates.
pub async fn manifests(State(state): State<AppState>) -> ApiResult<ManifestsResponse> {
    Ok(Json(state.coordinator.manifests().await?))
}

/// `POST /api/v1/manifest`: set or update the manifest.
pub async fn set_manifest(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<SetManifestRequest>,
) -> ApiResult<SetManifestResponse> {
    Ok(Json(state.coordinator.set_manifest(body).await?))
}

/// `POST /api/v1/recover`: hand the secret seed back after a restart.
pub async fn recover(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RecoverRequest>,
) -> ApiResult<RecoverResponse> {
    Ok(Json(state.coordinator.recover(body).await?))
}
