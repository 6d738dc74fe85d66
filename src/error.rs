//! Error types for authgate

use std::io;

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::jwt::VerifyError;

/// Result type alias for authgate
pub type Result<T> = std::result::Result<T, Error>;

/// authgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token verification failed
    #[error("Token verification failed: {0}")]
    Verification(#[from] VerifyError),

    /// Provider rejected a refresh grant, or the refresh could not be made
    #[error("Token refresh failed: {0}")]
    Refresh(String),

    /// Non-2xx answer from a provider endpoint; forwarded as is
    #[error("Upstream error HTTP {status}: {body}")]
    Upstream {
        /// Provider status code
        status: u16,
        /// Provider response body
        body: String,
    },

    /// Missing or mismatched CSRF state
    #[error("CSRF check failed: {0}")]
    Csrf(String),

    /// No session cookie or no record behind it
    #[error("Session not found")]
    SessionNotFound,

    /// Unknown provider, or one without OAuth2 settings
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Invalid request from the caller
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request understood but refused
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Session or ephemeral store failure
    #[error("Store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// `true` for failures that mean "authenticate again".
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            Self::Verification(_) | Self::Refresh(_) | Self::SessionNotFound
        )
    }

    /// HTTP status used when this error ends a request.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Verification(_) | Self::Refresh(_) | Self::SessionNotFound => {
                StatusCode::PROXY_AUTHENTICATION_REQUIRED
            }
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Csrf(_) => StatusCode::UNAUTHORIZED,
            Self::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Http(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The `{"error": ...}` body returned when a request needs (re)authentication.
#[must_use]
pub fn auth_required_response() -> Response {
    error_body(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED
            .canonical_reason()
            .unwrap_or("Proxy Authentication Required"),
    )
}

/// JSON error body with the given status.
#[must_use]
pub fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Self::Upstream { status, body } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                let content_type = if body.trim_start().starts_with('{') {
                    "application/json"
                } else {
                    "text/plain; charset=utf-8"
                };
                (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
            }
            e if e.requires_auth() => auth_required_response(),
            e => {
                let status = e.status_code();
                if status.is_server_error() {
                    tracing::error!(error = %e, "Request failed");
                }
                error_body(status, &e.to_string())
            }
        }
    }
}
