//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use doc_store::StoreError;
use orders::PlacementError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Order placement failed.
    Placement(PlacementError),
    /// A read against the store failed.
    Store(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Placement(err) => placement_error_to_response(err),
            ApiError::Store(err) => store_error_to_response(err),
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        }
        metrics::counter!("api_errors_total", "status" => status.as_u16().to_string())
            .increment(1);

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn placement_error_to_response(err: PlacementError) -> (StatusCode, String) {
    let status = match &err {
        PlacementError::InvalidCart(_) => StatusCode::BAD_REQUEST,
        PlacementError::InsufficientInventory { .. } => StatusCode::CONFLICT,
        PlacementError::CustomerNotFound(_) => StatusCode::NOT_FOUND,
        PlacementError::TransientStore(_) | PlacementError::DuplicateRequest { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PlacementError::AmbiguousCommit { .. } | PlacementError::FatalStore(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

fn store_error_to_response(err: StoreError) -> (StatusCode, String) {
    let status = if err.is_transient() || err.is_connection_loss() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, err.to_string())
}

impl From<PlacementError> for ApiError {
    fn from(err: PlacementError) -> Self {
        ApiError::Placement(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}
