//! Error types for the Tollgate rate limiter.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid options detected while building a limiter
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store read or write failure
    #[error("Counter store error: {0}")]
    Store(String),

    /// Malformed YAML configuration
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

/// Failures inside the request hooks surface as `500 Internal Server Error`.
impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        error!(error = %self, "Rate limiter failed, rejecting request");

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "statusCode": 500,
                "error": "Internal Server Error",
                "message": "An internal server error occurred",
            })),
        )
            .into_response()
    }
}
