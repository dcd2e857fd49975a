//! OAuth2/OIDC error taxonomy and its wire representation.
//!
//! Every validation failure in the core ends up as an [`OAuthError`]. The
//! variant decides the `error` code and HTTP status; the message becomes the
//! `error_description`, except for `server_error` whose cause is logged and
//! never sent to the caller.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    InvalidClient(String),
    #[error("{0}")]
    InvalidGrant(String),
    #[error("{0}")]
    InvalidScope(String),
    #[error("{0}")]
    UnauthorizedClient(String),
    #[error("{0}")]
    UnsupportedGrantType(String),
    #[error("{0}")]
    UnsupportedResponseType(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("{0}")]
    LoginRequired(String),
    #[error("{0}")]
    TwoFactorRequired(String),
    #[error("{0}")]
    InvalidToken(String),
    #[error("{0}")]
    NotAuthorized(String),
    #[error("too many requests")]
    TooManyRequests { retry_after_seconds: u64 },
    #[error("internal server error")]
    ServerError(#[source] anyhow::Error),
}

impl OAuthError {
    /// Wire error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::InvalidScope(_) => "invalid_scope",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::UnsupportedResponseType(_) => "unsupported_response_type",
            Self::AccessDenied(_) => "access_denied",
            Self::LoginRequired(_) => "login_required",
            Self::TwoFactorRequired(_) => "two_factor_required",
            Self::InvalidToken(_) => "invalid_token",
            Self::NotAuthorized(_) => "not_authorized",
            Self::TooManyRequests { .. } => "too_many_requests",
            Self::ServerError(_) => "server_error",
        }
    }

    #[must_use]
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidGrant(_)
            | Self::InvalidScope(_)
            | Self::UnauthorizedClient(_)
            | Self::UnsupportedGrantType(_)
            | Self::UnsupportedResponseType(_)
            | Self::LoginRequired(_)
            | Self::TwoFactorRequired(_) => StatusCode::BAD_REQUEST,
            Self::InvalidClient(_) | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::AccessDenied(_) | Self::NotAuthorized(_) => StatusCode::FORBIDDEN,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Description safe to show to the caller.
    #[must_use]
    pub fn description(&self) -> Option<String> {
        match self {
            Self::ServerError(_) | Self::TooManyRequests { .. } => None,
            other => Some(other.to_string()),
        }
    }

    #[must_use]
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.error_code().to_string(),
            error_description: self.description(),
        }
    }

    pub fn server(err: impl Into<anyhow::Error>) -> Self {
        Self::ServerError(err.into())
    }
}

impl From<StoreError> for OAuthError {
    fn from(err: StoreError) -> Self {
        Self::ServerError(err.into())
    }
}

impl From<anyhow::Error> for OAuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::ServerError(err)
    }
}

/// OAuth2 error body (RFC 6749 §5.2).
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        if let Self::ServerError(err) = &self {
            error!("server_error: {err:#}");
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        match &self {
            Self::InvalidClient(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"sso\""),
                );
            }
            Self::InvalidToken(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer error=\"invalid_token\""),
                );
            }
            Self::TooManyRequests {
                retry_after_seconds,
            } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                    headers.insert(header::RETRY_AFTER, value);
                }
            }
            _ => {}
        }

        (self.http_status(), headers, Json(self.to_error_response())).into_response()
    }
}
