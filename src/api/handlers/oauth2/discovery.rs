//! OpenID provider metadata and the public signing keys.

use axum::{
    Json,
    extract::Extension,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::api::state::AppState;
use crate::oauth2::id_token::{ACR_TWO_FACTOR, JwkSet};

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub revocation_endpoint: String,
    pub introspection_endpoint: String,
    pub end_session_endpoint: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub claims_supported: Vec<String>,
    pub acr_values_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

impl ProviderMetadata {
    #[must_use]
    pub fn for_issuer(issuer: &str) -> Self {
        let endpoint = |path: &str| format!("{issuer}{path}");
        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: endpoint("/authorize"),
            token_endpoint: endpoint("/token"),
            userinfo_endpoint: endpoint("/userinfo"),
            jwks_uri: endpoint("/jwks"),
            revocation_endpoint: endpoint("/revoke"),
            introspection_endpoint: endpoint("/introspect"),
            end_session_endpoint: endpoint("/logout"),
            response_types_supported: strings(&["code"]),
            grant_types_supported: strings(&[
                "authorization_code",
                "refresh_token",
                "client_credentials",
                "password",
            ]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: strings(&["EdDSA"]),
            scopes_supported: strings(&["openid", "profile", "email", "permissions"]),
            claims_supported: strings(&[
                "sub",
                "iss",
                "aud",
                "exp",
                "iat",
                "auth_time",
                "nonce",
                "acr",
                "amr",
                "name",
                "preferred_username",
                "email",
                "permissions",
            ]),
            acr_values_supported: strings(&[ACR_TWO_FACTOR]),
            code_challenge_methods_supported: strings(&["plain", "S256"]),
            token_endpoint_auth_methods_supported: strings(&[
                "client_secret_basic",
                "client_secret_post",
                "none",
            ]),
        }
    }
}

#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    responses((status = 200, description = "OpenID provider metadata", body = ProviderMetadata)),
    tag = "oauth2"
)]
pub async fn openid_configuration(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(ProviderMetadata::for_issuer(state.config().issuer()))
}

#[utoipa::path(
    get,
    path = "/jwks",
    responses((status = 200, description = "Public keys for ID token verification", body = JwkSet)),
    tag = "oauth2"
)]
pub async fn jwks(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(state.id_tokens().jwks()),
    )
}
