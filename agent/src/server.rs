//! HTTP surface of the guest agent: the host submits each privileged
//! request and gets a decision.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::enforcer::AgentState;
use crate::error::EnforcementError;
use crate::request::AgentRequest;

pub const REQUEST_PATH: &str = "/api/v1/request";

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentHealth {
    pub status: String,
    pub enforcing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_digest: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct Denied(EnforcementError);

impl IntoResponse for Denied {
    fn into_response(self) -> Response {
        let body = Decision {
            allowed: false,
            rule: Some(self.0.rule().to_string()),
            reason: Some(self.0.to_string()),
        };
        (StatusCode::FORBIDDEN, Json(body)).into_response()
    }
}

pub fn build_router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(REQUEST_PATH, post(request))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<Arc<AgentState>>) -> Json<AgentHealth> {
    let policy_digest = match state.as_ref() {
        AgentState::Enforcing(enforcer) => Some(enforcer.digest().to_string()),
        AgentState::Failed(_) => None,
    };
    Json(AgentHealth {
        status: "ok".to_string(),
        enforcing: state.is_enforcing(),
        policy_digest,
    })
}

async fn request(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<AgentRequest>,
) -> Result<Json<Decision>, Denied> {
    state.check(&request).map_err(Denied)?;
    Ok(Json(Decision {
        allowed: true,
        rule: None,
        reason: None,
    }))
}
