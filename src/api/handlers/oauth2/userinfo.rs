use axum::{
    Json,
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Instrument;
use utoipa::ToSchema;

use crate::api::handlers::utils::extract_bearer_token;
use crate::api::state::AppState;
use crate::directory::User;
use crate::oauth2::guard::{ClientActive, ClientAllowList, GuardChain, GuardContext, RequireScopes};
use crate::oauth2::scope::OPENID;
use crate::oauth2::token::BearerStatus;
use crate::oauth2::{ErrorResponse, OAuthError, ScopeSet};

const PROFILE: &str = "profile";
const EMAIL: &str = "email";
const PERMISSIONS: &str = "permissions";

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl UserInfo {
    /// Claims released for the granted scopes.
    fn released(user: User, scopes: &ScopeSet) -> Self {
        let profile = scopes.contains(PROFILE);
        Self {
            sub: user.id.to_string(),
            name: profile.then(|| user.name.clone()),
            preferred_username: profile.then(|| user.username.clone()),
            email: scopes.contains(EMAIL).then_some(user.email),
            permissions: scopes.contains(PERMISSIONS).then_some(user.permissions),
        }
    }
}

fn invalid_token() -> OAuthError {
    OAuthError::InvalidToken("access token is missing, unknown or expired".to_string())
}

#[utoipa::path(
    get,
    path = "/userinfo",
    responses(
        (status = 200, description = "Claims about the token's user", body = UserInfo),
        (status = 401, description = "Invalid bearer token", body = ErrorResponse),
        (status = 403, description = "Token lacks the openid scope", body = ErrorResponse)
    ),
    tag = "oauth2"
)]
pub async fn userinfo(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Result<Response, OAuthError> {
    let token = extract_bearer_token(&headers).ok_or_else(invalid_token)?;
    let grant = match state.tokens().validate_bearer(&token).await? {
        BearerStatus::Active(grant) => grant,
        BearerStatus::Expired | BearerStatus::NotFound => return Err(invalid_token()),
    };

    let span = tracing::info_span!("store.find_client", client_id = %grant.client_id);
    let client = state
        .store()
        .find_client(&grant.client_id)
        .instrument(span)
        .await?;
    let required = ScopeSet::parse(OPENID).map_err(|err| OAuthError::ServerError(err.into()))?;
    let mut guards = GuardChain::new()
        .with(ClientActive)
        .with(RequireScopes::new(required));
    let allowed = state.config().userinfo_clients();
    if !allowed.is_empty() {
        guards = guards.with(ClientAllowList::new(allowed.iter().cloned()));
    }
    guards
        .evaluate(&GuardContext {
            client: client.as_ref(),
            grant: &grant,
        })?;

    let user = state
        .directory()
        .find_user_by_id(grant.user_id)
        .await?
        .filter(|user| user.is_active)
        .ok_or_else(invalid_token)?;
    Ok(Json(UserInfo::released(user, &grant.scopes)).into_response())
}
