use axum::extract::{Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use contrast_common::api::ErrorResponse;
use contrast_common::ContrastError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::AppState;

const WINDOW: Duration = Duration::from_secs(60);

/// Per-IP fixed window limiter for the attestation endpoints.
#[derive(Clone)]
pub struct RateLimiter {
    requests_per_minute: u32,
    clients: Arc<Mutex<HashMap<IpAddr, WindowEntry>>>,
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `Err(retry_after)` when `ip` has used up its window.
    pub async fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let mut clients = self.clients.lock().await;
        let now = Instant::now();

        let entry = clients.entry(ip).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });
        let elapsed = now.duration_since(entry.window_start);
        if elapsed > WINDOW {
            entry.count = 1;
            entry.window_start = now;
            return Ok(());
        }
        entry.count += 1;
        if entry.count <= self.requests_per_minute {
            Ok(())
        } else {
            Err(WINDOW.saturating_sub(elapsed))
        }
    }

    pub fn spawn_cleanup_task(&self) {
        let clients = self.clients.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WINDOW * 5);
            loop {
                interval.tick().await;
                let now = Instant::now();
                clients
                    .lock()
                    .await
                    .retain(|_, entry| now.duration_since(entry.window_start) < WINDOW * 2);
            }
        });
    }
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

/// Paths subject to rate limiting: the ones that cost a nonce or a report.
fn is_limited(path: &str) -> bool {
    matches!(
        path,
        contrast_common::api::NONCE_PATH
            | contrast_common::api::ATTEST_PATH
            | contrast_common::api::ATTESTATION_PATH
    )
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let limiter = match &state.rate_limiter {
        Some(l) if is_limited(request.uri().path()) => l,
        _ => return next.run(request).await,
    };

    match limiter.check(client_ip(&request)).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(event = "rate_limited", path = %request.uri().path());
            let err = ContrastError::ResourceExhausted("rate limit exceeded".to_string());
            let mut response =
                (StatusCode::TOO_MANY_REQUESTS, Json(ErrorResponse::from(&err))).into_response();
            if let Ok(v) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(RETRY_AFTER, v);
            }
            response
        }
    }
}
