//! Session cookie helpers and the session/logout endpoints.

use axum::{
    Json,
    extract::{Extension, Query},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{InvalidHeaderValue, LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::types::LogoutParams;
use crate::api::handlers::utils::extract_cookie;
use crate::api::state::{AppState, AuthConfig};
use crate::session::SessionClaims;

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionClaims),
        (status = 204, description = "No active session")
    ),
    tag = "auth"
)]
pub async fn session(headers: HeaderMap, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    // Missing or invalid cookies are treated as "no session".
    match current_session(&state, &headers) {
        Some(claims) => (StatusCode::OK, Json(claims)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/logout",
    params(
        ("client_id" = Option<String>, Query, description = "Client that owns the redirect URI"),
        ("post_logout_redirect_uri" = Option<String>, Query, description = "Registered post-logout redirect URI"),
        ("state" = Option<String>, Query, description = "Echoed to the redirect URI")
    ),
    responses(
        (status = 204, description = "Session cleared"),
        (status = 303, description = "Session cleared, redirecting to the client")
    ),
    tag = "auth"
)]
pub async fn logout(
    Query(params): Query<LogoutParams>,
    state: Extension<Arc<AppState>>,
) -> Response {
    // Always clear the cookie, even when no session was presented.
    let mut headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(state.config()) {
        headers.insert(SET_COOKIE, cookie);
    }

    if let Some(location) = post_logout_location(&state, &params).await {
        if let Ok(value) = HeaderValue::from_str(&location) {
            headers.insert(LOCATION, value);
            return (StatusCode::SEE_OTHER, headers).into_response();
        }
    }
    (StatusCode::NO_CONTENT, headers).into_response()
}

async fn post_logout_location(state: &AppState, params: &LogoutParams) -> Option<String> {
    let uri = params.post_logout_redirect_uri.as_deref()?;
    let client_id = params.client_id.as_deref()?;
    let client = match state.clients().resolve(client_id).await {
        Ok(client) => client,
        Err(err) => {
            debug!("Ignoring post-logout redirect: {err}");
            return None;
        }
    };
    if !client.validate_post_logout_redirect(uri) {
        warn!(client_id, "post_logout_redirect_uri is not registered");
        return None;
    }
    let mut url = Url::parse(uri).ok()?;
    if let Some(value) = params.state.as_deref() {
        url.query_pairs_mut().append_pair("state", value);
    }
    Some(url.to_string())
}

/// Decode the session cookie. Any failure means "not signed in".
pub(crate) fn current_session(state: &AppState, headers: &HeaderMap) -> Option<SessionClaims> {
    let token = extract_cookie(headers, state.config().session_cookie_name())?;
    match state.sessions().decode(&token) {
        Ok(claims) => Some(claims),
        Err(err) => {
            debug!("Rejected session cookie: {err}");
            None
        }
    }
}

fn cookie_attributes(config: &AuthConfig, max_age: i64) -> String {
    let mut attributes = format!(
        "Path=/; SameSite={}; Max-Age={max_age}",
        config.session_cookie_same_site().as_str()
    );
    if config.session_cookie_http_only() {
        attributes.push_str("; HttpOnly");
    }
    if config.session_cookie_secure() {
        attributes.push_str("; Secure");
    }
    attributes
}

/// Build the session cookie for a sealed session token.
pub(crate) fn session_cookie(
    config: &AuthConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let name = config.session_cookie_name();
    let attributes = cookie_attributes(config, config.session_ttl_seconds());
    HeaderValue::from_str(&format!("{name}={token}; {attributes}"))
}

pub(crate) fn clear_session_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let name = config.session_cookie_name();
    let attributes = cookie_attributes(config, 0);
    HeaderValue::from_str(&format!("{name}=; {attributes}"))
}
