//! Token endpoint.
//!
//! Flow Overview:
//! 1) Throttle per client IP and per `client_id` before any credential check.
//! 2) Authenticate the client (Basic header or form fields).
//! 3) Dispatch on `grant_type`; every grant is checked against the client
//!    type before anything is minted.

use axum::{
    Form, Json,
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::handlers::utils::{client_credentials, extract_client_ip, non_empty};
use crate::api::state::AppState;
use crate::login::{LoginError, LoginOutcome};
use crate::mfa::{Device, DeviceError};
use crate::oauth2::id_token::IdTokenRequest;
use crate::oauth2::scope::OPENID;
use crate::oauth2::token::{IssuedTokens, MintRequest};
use crate::oauth2::{Client, ClientRegistry, ErrorResponse, GrantType, OAuthError, ScopeSet};
use crate::throttle::{ThrottleAction, ThrottleDecision};

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct TokenRequest {
    #[serde(default)]
    pub grant_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

fn throttle(state: &AppState, key: &str) -> Result<(), OAuthError> {
    match state.rate_limiter().check(ThrottleAction::Token, key) {
        ThrottleDecision::Allowed => Ok(()),
        ThrottleDecision::Limited {
            retry_after_seconds,
        } => Err(OAuthError::TooManyRequests {
            retry_after_seconds,
        }),
    }
}

#[utoipa::path(
    post,
    path = "/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid grant or request", body = ErrorResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "oauth2"
)]
pub async fn token(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Form(request): Form<TokenRequest>,
) -> Result<Response, OAuthError> {
    let client_ip = extract_client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    throttle(&state, &client_ip)?;
    let credentials = client_credentials(
        &headers,
        non_empty(request.client_id.as_ref()),
        request.client_secret.as_deref(),
    )?;
    throttle(&state, &credentials.client_id)?;

    let client = state.clients().authenticate(&credentials).await?;
    let grant: GrantType = request.grant_type.as_deref().unwrap_or_default().parse()?;
    ClientRegistry::ensure_grant(&client, grant)?;

    let body = match grant {
        GrantType::AuthorizationCode => authorization_code(&state, &client, &request).await?,
        GrantType::RefreshToken => refresh_token(&state, &client, &request).await?,
        GrantType::ClientCredentials => client_credentials_grant(&state, &client, &request).await?,
        GrantType::Password => password(&state, &client, &request).await?,
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response_headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    if let Some(origin) = allowed_origin(&headers, &client) {
        response_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        response_headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    Ok((StatusCode::OK, response_headers, Json(body)).into_response())
}

/// Echo the `Origin` back when a trustworthy client calls from one of its
/// redirect origins.
fn allowed_origin(headers: &HeaderMap, client: &Client) -> Option<HeaderValue> {
    let origin = headers.get(header::ORIGIN)?;
    let value = origin.to_str().ok()?;
    client.allowed_origin(value).then(|| origin.clone())
}

/// Requested scopes, or everything the client may ask for.
fn requested_scopes(client: &Client, scope: Option<&str>) -> Result<ScopeSet, OAuthError> {
    let Some(scope) = scope else {
        return Ok(client.scopes.clone());
    };
    let scopes =
        ScopeSet::parse(scope).map_err(|err| OAuthError::InvalidScope(err.to_string()))?;
    if !scopes.is_subset(&client.scopes) {
        return Err(OAuthError::InvalidScope(format!(
            "scope not allowed for client: {}",
            scopes.missing_from(&client.scopes).join(" ")
        )));
    }
    Ok(scopes)
}

/// Method reference of the device a grant is bound to.
async fn second_factor(
    state: &AppState,
    user_id: Uuid,
    device_id: Option<Uuid>,
) -> Result<Option<&'static str>, OAuthError> {
    let Some(device_id) = device_id else {
        return Ok(None);
    };
    method_reference(state.devices().get(user_id, device_id).await)
}

/// A removed device no longer vouches for the grant.
fn method_reference(lookup: Result<Device, DeviceError>) -> Result<Option<&'static str>, OAuthError> {
    match lookup {
        Ok(device) => Ok(Some(device.amr())),
        Err(DeviceError::NotFound) => {
            debug!("device bound to grant is gone, omitting second factor");
            Ok(None)
        }
        Err(err) => {
            error!("Failed to load device bound to grant: {err}");
            Err(OAuthError::server(err))
        }
    }
}

struct IdTokenInput<'a> {
    client: &'a Client,
    issued: &'a IssuedTokens,
    nonce: Option<&'a str>,
}

async fn respond(state: &AppState, input: IdTokenInput<'_>) -> Result<TokenResponse, OAuthError> {
    let grant = &input.issued.grant;
    let id_token = if grant.scopes.contains(OPENID) {
        let second_factor = second_factor(state, grant.user_id, grant.device_id).await?;
        let request = IdTokenRequest {
            client_id: &input.client.client_id,
            user_id: grant.user_id,
            auth_time: grant.auth_time,
            nonce: input.nonce,
            second_factor,
        };
        Some(state.id_tokens().sign(&request)?)
    } else {
        None
    };
    Ok(TokenResponse {
        access_token: input.issued.access_token.clone(),
        token_type: "Bearer".to_string(),
        refresh_token: input.issued.refresh_token.clone(),
        expires_in: input.issued.expires_in,
        scope: grant.scopes.to_string(),
        id_token,
    })
}

async fn authorization_code(
    state: &AppState,
    client: &Client,
    request: &TokenRequest,
) -> Result<TokenResponse, OAuthError> {
    let code = non_empty(request.code.as_ref())
        .ok_or_else(|| OAuthError::InvalidRequest("missing code".to_string()))?;
    let redirect_uri = non_empty(request.redirect_uri.as_ref())
        .ok_or_else(|| OAuthError::InvalidRequest("missing redirect_uri".to_string()))?;
    let redeemed = state
        .codes()
        .redeem(
            code,
            client,
            redirect_uri,
            non_empty(request.code_verifier.as_ref()),
        )
        .await?;
    let issued = state
        .tokens()
        .mint_pair(MintRequest {
            client_id: client.client_id.clone(),
            user_id: redeemed.user_id,
            scopes: redeemed.scopes.clone(),
            device_id: redeemed.device_id,
            family_id: Some(redeemed.family_id),
            auth_time: redeemed.auth_time,
        })
        .await?;
    info!(client_id = %client.client_id, user_id = %redeemed.user_id, "authorization code exchanged");
    respond(
        state,
        IdTokenInput {
            client,
            issued: &issued,
            nonce: redeemed.nonce.as_deref(),
        },
    )
    .await
}

async fn refresh_token(
    state: &AppState,
    client: &Client,
    request: &TokenRequest,
) -> Result<TokenResponse, OAuthError> {
    let refresh = non_empty(request.refresh_token.as_ref()).unwrap_or_default();
    let issued = state.tokens().rotate(refresh, client).await?;
    respond(
        state,
        IdTokenInput {
            client,
            issued: &issued,
            nonce: None,
        },
    )
    .await
}

async fn client_credentials_grant(
    state: &AppState,
    client: &Client,
    request: &TokenRequest,
) -> Result<TokenResponse, OAuthError> {
    let Some(service_user) = client.service_user else {
        return Err(OAuthError::UnauthorizedClient(
            "client has no service user".to_string(),
        ));
    };
    let scopes = requested_scopes(client, non_empty(request.scope.as_ref()))?;
    let issued = state
        .tokens()
        .mint_bearer(MintRequest {
            client_id: client.client_id.clone(),
            user_id: service_user,
            scopes,
            device_id: None,
            family_id: None,
            auth_time: Utc::now(),
        })
        .await?;
    Ok(TokenResponse {
        access_token: issued.access_token,
        token_type: "Bearer".to_string(),
        refresh_token: None,
        expires_in: issued.expires_in,
        scope: issued.grant.scopes.to_string(),
        id_token: None,
    })
}

async fn password(
    state: &AppState,
    client: &Client,
    request: &TokenRequest,
) -> Result<TokenResponse, OAuthError> {
    let (Some(username), Some(password)) = (
        non_empty(request.username.as_ref()),
        request.password.as_deref().filter(|password| !password.is_empty()),
    ) else {
        return Err(OAuthError::InvalidRequest(
            "username and password are required".to_string(),
        ));
    };
    if let ThrottleDecision::Limited {
        retry_after_seconds,
    } = state
        .rate_limiter()
        .check(ThrottleAction::Login, &username.to_lowercase())
    {
        return Err(OAuthError::TooManyRequests {
            retry_after_seconds,
        });
    }
    let scopes = requested_scopes(client, non_empty(request.scope.as_ref()))?;

    let authenticated = match state.login().authenticate(username, password, None, false).await {
        Ok(LoginOutcome::Authenticated(authenticated)) => authenticated,
        Ok(LoginOutcome::AwaitingChallenge(_)) | Err(LoginError::MfaEnrollmentRequired) => {
            warn!(client_id = %client.client_id, "password grant refused: second factor required");
            return Err(OAuthError::AccessDenied(
                "multi-factor authentication required".to_string(),
            ));
        }
        Err(LoginError::Throttled {
            retry_after_seconds,
        }) => {
            return Err(OAuthError::TooManyRequests {
                retry_after_seconds,
            });
        }
        Err(LoginError::Internal(err)) => return Err(OAuthError::ServerError(err)),
        Err(_) => {
            return Err(OAuthError::InvalidGrant(
                "invalid username or password".to_string(),
            ));
        }
    };

    let issued = state
        .tokens()
        .mint_pair(MintRequest {
            client_id: client.client_id.clone(),
            user_id: authenticated.user.id,
            scopes,
            device_id: None,
            family_id: None,
            auth_time: authenticated.auth_time,
        })
        .await?;
    respond(
        state,
        IdTokenInput {
            client,
            issued: &issued,
            nonce: None,
        },
    )
    .await
}
