//! Token revocation and introspection. Both require client authentication.

use axum::{
    Form, Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use utoipa::ToSchema;

use crate::api::handlers::utils::{client_credentials, non_empty};
use crate::api::state::AppState;
use crate::oauth2::token::Introspection;
use crate::oauth2::{Client, ErrorResponse, OAuthError};

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct TokenActionRequest {
    #[serde(default)]
    pub token: Option<String>,
    /// Accepted and ignored; both token kinds are looked up.
    #[serde(default)]
    pub token_type_hint: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

async fn authenticated_client(
    state: &AppState,
    headers: &HeaderMap,
    request: &TokenActionRequest,
) -> Result<Client, OAuthError> {
    let credentials = client_credentials(
        headers,
        non_empty(request.client_id.as_ref()),
        request.client_secret.as_deref(),
    )?;
    state.clients().authenticate(&credentials).await
}

#[utoipa::path(
    post,
    path = "/revoke",
    request_body(content = TokenActionRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token revoked, or it was already unknown"),
        (status = 400, description = "Missing token", body = ErrorResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse)
    ),
    tag = "oauth2"
)]
pub async fn revoke(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Form(request): Form<TokenActionRequest>,
) -> Result<Response, OAuthError> {
    let client = authenticated_client(&state, &headers, &request).await?;
    let token = non_empty(request.token.as_ref())
        .ok_or_else(|| OAuthError::InvalidRequest("missing token".to_string()))?;
    state.tokens().revoke(token, &client).await?;
    debug!(client_id = %client.client_id, "token revoked");
    Ok(StatusCode::OK.into_response())
}

#[utoipa::path(
    post,
    path = "/introspect",
    request_body(content = TokenActionRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token metadata", body = Introspection),
        (status = 400, description = "Missing token", body = ErrorResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse)
    ),
    tag = "oauth2"
)]
pub async fn introspect(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Form(request): Form<TokenActionRequest>,
) -> Result<Response, OAuthError> {
    let client = authenticated_client(&state, &headers, &request).await?;
    let token = non_empty(request.token.as_ref())
        .ok_or_else(|| OAuthError::InvalidRequest("missing token".to_string()))?;
    let introspection = state.tokens().introspect(token, &client).await?;
    Ok((
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-store")],
        Json(introspection),
    )
        .into_response())
}
