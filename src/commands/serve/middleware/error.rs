use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::commands::serve::models::ErrorResponse;

/// Custom error type for API handlers
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    /// Upstream unreachable and no cached snapshot to fall back to.
    ServiceUnavailable {
        symbol: String,
        retry_after_ms: u64,
    },
    Internal(String),
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "BadRequest".to_string(),
                    message: msg,
                }),
            )
                .into_response(),
            AppError::ServiceUnavailable {
                symbol,
                retry_after_ms,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "depth unavailable",
                    "symbol": symbol,
                    "retryAfter": retry_after_ms,
                })),
            )
                .into_response(),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "InternalError".to_string(),
                        message: "An internal error occurred".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
