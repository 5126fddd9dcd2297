pub mod api_types;
pub mod audit;
pub mod authority;
pub mod freshness;
pub mod rate_limit;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use contrast_common::api::{
    ATTESTATION_PATH, ATTEST_PATH, MANIFESTS_PATH, MANIFEST_PATH, NONCE_PATH, RECOVER_PATH,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub use authority::{Coordinator, CoordinatorConfig};
use rate_limit::RateLimiter;

/// Request bodies above this size are rejected before parsing.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state available to middleware and handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub rate_limiter: Option<RateLimiter>,
}

/// Server configuration.
pub struct ServerConfig {
    /// Maximum attestation requests per minute per IP. 0 disables rate limiting.
    pub requests_per_minute: u32,
}

/// Build the router without rate limiting (for local dev / tests).
pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    build_router_inner(AppState {
        coordinator,
        rate_limiter: None,
    })
}

/// Build the router with full production configuration.
pub fn build_router_with_config(coordinator: Arc<Coordinator>, config: &ServerConfig) -> Router {
    let rate_limiter = if config.requests_per_minute > 0 {
        let limiter = RateLimiter::new(config.requests_per_minute);
        limiter.spawn_cleanup_task();
        Some(limiter)
    } else {
        None
    };
    coordinator.nonces().spawn_cleanup_task();
    build_router_inner(AppState {
        coordinator,
        rate_limiter,
    })
}

fn build_router_inner(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(NONCE_PATH, get(routes::nonce))
        .route(ATTEST_PATH, post(routes::attest))
        .route(ATTESTATION_PATH, get(routes::attestation))
        .route(MANIFESTS_PATH, get(routes::manifests))
        .route(MANIFEST_PATH, post(routes::set_manifest))
        .route(RECOVER_PATH, post(routes::recover))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}
