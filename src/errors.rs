use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PurchaseError {
    #[error("client id is required")]
    InvalidRequest,
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl PurchaseError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageFailure(message.into())
    }
}

impl IntoResponse for PurchaseError {
    fn into_response(self) -> Response {
        match self {
            PurchaseError::InvalidRequest => bad_request_response(),
            PurchaseError::RateLimited {
                retry_after_seconds,
            } => too_many_requests_response(retry_after_seconds),
            PurchaseError::StorageFailure(_) => internal_error_response(),
        }
    }
}

pub fn bad_request_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Client ID is required" })),
    )
        .into_response()
}

pub fn too_many_requests_response(retry_after_seconds: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "Too Many Requests",
            "message": "You can only buy 1 corn per minute"
        })),
    )
        .into_response();
    if let Ok(retry_after) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
        response.headers_mut().insert("Retry-After", retry_after);
    }
    response
}

pub fn internal_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal Server Error" })),
    )
        .into_response()
}
