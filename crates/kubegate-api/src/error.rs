//! HTTP mapping for gateway errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub use kubegate_common::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Handler-facing wrapper that renders an [`Error`] as a JSON response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// HTTP status code
    pub code: u16,
    /// Stable machine-readable kind
    pub kind: &'static str,
    /// Human-readable message
    pub message: String,
    /// Failed sub-step of a composite operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl ErrorBody {
    /// Build the body for an error
    pub fn from_error(error: &Error) -> Self {
        Self {
            code: error.status_code(),
            kind: error.kind(),
            message: error.to_string(),
            step: error.step().map(str::to_string),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "request failed");
        } else {
            tracing::debug!(kind = self.0.kind(), error = %self.0, "request rejected");
        }

        (status, axum::Json(ErrorBody::from_error(&self.0))).into_response()
    }
}
