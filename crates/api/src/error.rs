//! Control API error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use monitor::MonitorError;
use statestore::StoreError;
use tokens::TokenError;
use tunnels::TunnelError;

/// Errors a handler can answer with
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Any invalid-token outcome on the public download path. Deliberately
    /// answered with status 444 and no body, the close-connection convention
    /// the fronting proxy turns into a dropped connection.
    #[error("invalid download token")]
    TokenRejected,

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error body for the admin-facing responses
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::TokenRejected => {
                let status =
                    StatusCode::from_u16(444).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return status.into_response();
            }
            ApiError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let body = ErrorResponse {
            error,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::FileNotFound { path } => {
                ApiError::NotFound(format!("file not found: {path}"))
            }
            TunnelError::PathEscape { .. } | TunnelError::NotRegularFile { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            TunnelError::NotFound { tunnel_id } => {
                ApiError::NotFound(format!("tunnel {tunnel_id} not found"))
            }
            TunnelError::Store(store) => ApiError::StoreUnavailable(store.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Store(store) => ApiError::StoreUnavailable(store.to_string()),
            // signature, expiry, replay, malformed: all one opaque outcome
            _ => ApiError::TokenRejected,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::StoreUnavailable(err.to_string())
    }
}

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        match err {
            MonitorError::Store(store) => ApiError::StoreUnavailable(store.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
