use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use contrast_common::api::ErrorResponse;
use contrast_common::ContrastError;
use serde::de::DeserializeOwned;

/// `ContrastError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ContrastError);

impl From<ContrastError> for ApiError {
    fn from(err: ContrastError) -> Self {
        Self(err)
    }
}

/// HTTP status for each error class.
pub fn status_for(err: &ContrastError) -> StatusCode {
    match err {
        ContrastError::InvalidManifest(_)
        | ContrastError::InvalidPolicy(_)
        | ContrastError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ContrastError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ContrastError::Verification(_) | ContrastError::RecoveryFailed(_) => StatusCode::FORBIDDEN,
        ContrastError::NoManifest
        | ContrastError::InvalidState(_)
        | ContrastError::ManifestConflict(_) => StatusCode::CONFLICT,
        ContrastError::NotRecovered => StatusCode::SERVICE_UNAVAILABLE,
        ContrastError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ContrastError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(ErrorResponse::from(&self.0))).into_response()
    }
}

pub fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(ContrastError::InvalidInput(msg.into()))
}

/// JSON request body whose rejections use the API error body.
///
/// Bodies that fail to parse or deserialize are answered with 400 and an
/// `ErrorResponse`. Oversized bodies keep their 413.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                Err(rejection.into_response())
            }
            Err(rejection) => Err(bad_request(format!(
                "invalid request body: {}",
                rejection.body_text()
            ))
            .into_response()),
        }
    }
}
