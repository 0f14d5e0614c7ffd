use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Errors surfaced by the enrichment pipeline.
///
/// Clone is required because deduplicated workflow invocations share one
/// failure across every caller that joined the in-flight run.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Lead store query or write failed.
    Database(String),
    /// Lead or job id that is not (or no longer) known.
    NotFound(String),
    /// Invalid batch request.
    BadRequest(String),
    /// A lookup provider or the email verifier misbehaved: unreachable,
    /// non-success status, or an undecodable response.
    Provider(String),
    /// The store circuit breaker is open; writes are being shed.
    StoreUnavailable(String),
    /// Anything else.
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(msg) => write!(f, "Database error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Provider(msg) => write!(f, "Provider error: {}", msg),
            AppError::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Maps each error variant to an appropriate HTTP status code and JSON body.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(msg) => {
                tracing::error!("Database error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Provider(msg) => {
                tracing::error!("Provider error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "External service error".to_string(),
                )
            }
            AppError::StoreUnavailable(msg) => {
                tracing::warn!("Store unavailable: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Provider(err.to_string())
    }
}
