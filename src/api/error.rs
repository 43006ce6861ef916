//! API error taxonomy and its HTTP mapping.
//!
//! Every error leaving a handler is an [`ApiError`]; the `IntoResponse`
//! impl renders `{"error": "<message>"}` with the mapped status code, so
//! clients see one shape everywhere.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::auth::AuthError;
use crate::billing::quota::QuotaError;
use crate::provider::ProviderError;

/// Errors surfaced by the REST API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed body, missing field, or invalid enum value.
    #[error("{0}")]
    BadRequest(String),

    /// Missing or invalid credentials.
    #[error("{0}")]
    Unauthorized(String),

    /// Valid credentials for the wrong resource.
    #[error("{0}")]
    Forbidden(String),

    /// The referenced resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The org is at its instance quota.
    #[error("{0}")]
    QuotaExceeded(String),

    /// Downstream failure the client cannot fix.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        if e.is_not_found() {
            Self::NotFound(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::KeyMaterial(_) => Self::Internal(e.to_string()),
            _ => Self::Unauthorized(e.to_string()),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(e: QuotaError) -> Self {
        Self::QuotaExceeded(e.to_string())
    }
}
