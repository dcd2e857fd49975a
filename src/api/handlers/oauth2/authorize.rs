//! Authorization endpoint (code flow).
//!
//! Flow Overview:
//! 1) Resolve the client and its redirect URI. Failures here are answered
//!    directly; the user agent is never sent to an unverified URI.
//! 2) Validate `response_type`, scope and PKCE; failures are redirected back.
//! 3) Without a usable session the user is sent to the login page with the
//!    original request as `next`.
//! 4) Issue a single-use code bound to the session's user and MFA device.

use axum::{
    Json,
    extract::{Extension, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error};
use url::Url;
use utoipa::IntoParams;

use crate::api::handlers::auth::current_session;
use crate::api::state::AppState;
use crate::oauth2::code::IssueRequest;
use crate::oauth2::id_token::ACR_TWO_FACTOR;
use crate::oauth2::pkce::PkceChallenge;
use crate::oauth2::{Client, ClientRegistry, ErrorResponse, GrantType, OAuthError, ScopeSet};
use crate::session::SessionClaims;

#[derive(Deserialize, IntoParams, Debug, Default, Clone)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeParams {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// `none` or `login`.
    pub prompt: Option<String>,
    pub max_age: Option<i64>,
    pub acr_values: Option<String>,
}

impl AuthorizeParams {
    fn prompts(&self) -> impl Iterator<Item = &str> {
        self.prompt.as_deref().unwrap_or_default().split_whitespace()
    }

    fn wants_two_factor(&self) -> bool {
        self.acr_values
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .any(|value| value == ACR_TWO_FACTOR)
    }

    /// The request to come back to after login. `prompt=login` is dropped so
    /// the user is not sent round in circles.
    fn resume_url(&self) -> String {
        let mut params = self.clone();
        params.prompt = params
            .prompt
            .as_deref()
            .map(|prompt| {
                prompt
                    .split_whitespace()
                    .filter(|value| *value != "login")
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|prompt| !prompt.is_empty());
        let max_age = params.max_age.map(|value| value.to_string());
        let pairs = [
            ("response_type", &params.response_type),
            ("client_id", &params.client_id),
            ("redirect_uri", &params.redirect_uri),
            ("scope", &params.scope),
            ("state", &params.state),
            ("nonce", &params.nonce),
            ("code_challenge", &params.code_challenge),
            ("code_challenge_method", &params.code_challenge_method),
            ("prompt", &params.prompt),
            ("max_age", &max_age),
            ("acr_values", &params.acr_values),
        ];
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in pairs {
            if let Some(value) = value {
                query.append_pair(key, value);
            }
        }
        format!("/authorize?{}", query.finish())
    }
}

/// Errors answered to the user agent itself.
fn direct_error(err: &OAuthError) -> Response {
    debug!("authorize request rejected: {err}");
    (StatusCode::BAD_REQUEST, Json(err.to_error_response())).into_response()
}

fn see_other(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::SEE_OTHER, [(header::LOCATION, value)]).into_response(),
        Err(err) => {
            error!("Failed to build redirect: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn redirect_with(redirect_uri: &Url, pairs: &[(&str, Option<&str>)]) -> Response {
    let mut url = redirect_uri.clone();
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in pairs {
            if let Some(value) = value {
                query.append_pair(key, value);
            }
        }
    }
    see_other(url.as_str())
}

fn redirect_error(redirect_uri: &Url, err: &OAuthError, state: Option<&str>) -> Response {
    if let OAuthError::ServerError(cause) = err {
        error!("authorize failed: {cause:#}");
    }
    let description = err.description();
    redirect_with(
        redirect_uri,
        &[
            ("error", Some(err.error_code())),
            ("error_description", description.as_deref()),
            ("state", state),
        ],
    )
}

fn login_redirect(state: &AppState, params: &AuthorizeParams, two_factor: bool) -> Response {
    let login_url = state.config().login_url();
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("next", &params.resume_url());
    if two_factor {
        query.append_pair("two_factor", "1");
    }
    let separator = if login_url.contains('?') { '&' } else { '?' };
    see_other(&format!("{login_url}{separator}{}", query.finish()))
}

/// A session that still belongs to an active user.
async fn active_session(state: &AppState, headers: &HeaderMap) -> Result<Option<SessionClaims>, OAuthError> {
    let Some(claims) = current_session(state, headers) else {
        return Ok(None);
    };
    let user = state.directory().find_user_by_id(claims.sub).await?;
    Ok(user.filter(|user| user.is_active).map(|_| claims))
}

/// The registered redirect URI as sent (codes are bound to the exact string)
/// and its parsed form.
fn resolve_redirect(client: &Client, requested: Option<&str>) -> Result<(String, Url), OAuthError> {
    let uri = match requested.filter(|uri| !uri.is_empty()) {
        Some(uri) => uri,
        None if client.redirect_uris.len() == 1 => client
            .redirect_uris
            .iter()
            .next()
            .map(String::as_str)
            .unwrap_or_default(),
        None => {
            return Err(OAuthError::InvalidRequest(
                "missing redirect_uri".to_string(),
            ));
        }
    };
    if !ClientRegistry::validate_redirect(client, uri) {
        return Err(OAuthError::InvalidRequest(
            "redirect_uri is not registered".to_string(),
        ));
    }
    let url = Url::parse(uri)
        .map_err(|_| OAuthError::InvalidRequest("malformed redirect_uri".to_string()))?;
    Ok((uri.to_string(), url))
}

fn requested_scopes(client: &Client, scope: Option<&str>) -> Result<ScopeSet, OAuthError> {
    let scopes = ScopeSet::parse(scope.unwrap_or_default())
        .map_err(|err| OAuthError::InvalidScope(err.to_string()))?;
    if scopes.is_empty() {
        return Ok(client.scopes.clone());
    }
    if !scopes.is_subset(&client.scopes) {
        return Err(OAuthError::InvalidScope(format!(
            "scope not allowed for client: {}",
            scopes.missing_from(&client.scopes).join(" ")
        )));
    }
    Ok(scopes)
}

fn requested_pkce(
    state: &AppState,
    client: &Client,
    params: &AuthorizeParams,
) -> Result<Option<PkceChallenge>, OAuthError> {
    match params.code_challenge.as_deref().filter(|value| !value.is_empty()) {
        Some(challenge) => {
            PkceChallenge::from_request(challenge, params.code_challenge_method.as_deref()).map(Some)
        }
        None if state.config().pkce_required(client) => Err(OAuthError::InvalidRequest(
            "code_challenge is required for this client".to_string(),
        )),
        None => Ok(None),
    }
}

#[utoipa::path(
    get,
    path = "/authorize",
    params(AuthorizeParams),
    responses(
        (status = 303, description = "Redirect to the client with a code or an error, or to the login page"),
        (status = 400, description = "Unknown client or unregistered redirect_uri", body = ErrorResponse)
    ),
    tag = "oauth2"
)]
pub async fn authorize(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    let client = match state
        .clients()
        .resolve(params.client_id.as_deref().unwrap_or_default())
        .await
    {
        Ok(client) => client,
        Err(err) => return direct_error(&err),
    };
    let (registered_uri, redirect_uri) = match resolve_redirect(&client, params.redirect_uri.as_deref()) {
        Ok(resolved) => resolved,
        Err(err) => return direct_error(&err),
    };
    let client_state = params.state.as_deref();

    match params.response_type.as_deref() {
        Some("code") => {}
        Some(other) => {
            let err = OAuthError::UnsupportedResponseType(format!(
                "response_type {other} is not supported"
            ));
            return redirect_error(&redirect_uri, &err, client_state);
        }
        None => {
            let err = OAuthError::InvalidRequest("missing response_type".to_string());
            return redirect_error(&redirect_uri, &err, client_state);
        }
    }
    if let Err(err) = ClientRegistry::ensure_grant(&client, GrantType::AuthorizationCode) {
        return redirect_error(&redirect_uri, &err, client_state);
    }
    let scopes = match requested_scopes(&client, params.scope.as_deref()) {
        Ok(scopes) => scopes,
        Err(err) => return redirect_error(&redirect_uri, &err, client_state),
    };
    let pkce = match requested_pkce(&state, &client, &params) {
        Ok(pkce) => pkce,
        Err(err) => return redirect_error(&redirect_uri, &err, client_state),
    };

    let session = match active_session(&state, &headers).await {
        Ok(session) => session,
        Err(err) => return redirect_error(&redirect_uri, &err, client_state),
    };
    let prompt_none = params.prompts().any(|prompt| prompt == "none");
    let prompt_login = params.prompts().any(|prompt| prompt == "login");
    let two_factor = params.wants_two_factor();

    // A signed-in user without a device can never satisfy the step-up.
    if let Some(claims) = session.as_ref().filter(|claims| two_factor && claims.dev.is_none()) {
        match state.devices().default_device(claims.sub).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let err = OAuthError::TwoFactorRequired(
                    "the user has no two factor device".to_string(),
                );
                return redirect_error(&redirect_uri, &err, client_state);
            }
            Err(err) => return redirect_error(&redirect_uri, &OAuthError::server(err), client_state),
        }
    }

    let session = session.filter(|claims| {
        let too_old = params
            .max_age
            .is_some_and(|max_age| Utc::now().timestamp() - claims.auth_time > max_age);
        let missing_factor = two_factor && claims.dev.is_none();
        !(prompt_login || too_old || missing_factor)
    });
    let Some(session) = session else {
        if prompt_none {
            let err = OAuthError::LoginRequired("user is not signed in".to_string());
            return redirect_error(&redirect_uri, &err, client_state);
        }
        return login_redirect(&state, &params, two_factor);
    };

    let issued = state
        .codes()
        .issue(IssueRequest {
            client: &client,
            user_id: session.sub,
            redirect_uri: &registered_uri,
            scopes,
            pkce,
            nonce: params.nonce.clone().filter(|nonce| !nonce.is_empty()),
            device_id: session.dev,
            auth_time: session.auth_time(),
        })
        .await;
    match issued {
        Ok(code) => redirect_with(
            &redirect_uri,
            &[("code", Some(code.as_str())), ("state", client_state)],
        ),
        Err(err) => redirect_error(&redirect_uri, &err, client_state),
    }
}
