//! Primary-credential login.
//!
//! Flow Overview:
//! 1) Throttle per client IP and per identifier before touching credentials.
//! 2) Verify the password through the user directory.
//! 3) Either set the session cookie, or hand back a signed state blob and
//!    challenge material for `/v1/auth/mfa/verify`.

use axum::{
    Form, Json,
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use super::session::session_cookie;
use super::types::{LoginRequest, LoginResponse};
use crate::api::handlers::utils::extract_client_ip;
use crate::api::state::AppState;
use crate::login::{Authenticated, LoginError, LoginOutcome, PendingChallenge};
use crate::oauth2::ErrorResponse;
use crate::throttle::{ThrottleAction, ThrottleDecision};

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body(content = LoginRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Signed in, or a second factor is required", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 403, description = "Multi-factor enrollment required", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Form(request): Form<LoginRequest>,
) -> Response {
    let identifier = request.identifier.trim();
    if identifier.is_empty() || request.password.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            Some("identifier and password are required"),
        );
    }

    let client_ip = extract_client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    let identifier_key = identifier.to_lowercase();
    for key in [client_ip.as_str(), identifier_key.as_str()] {
        if let ThrottleDecision::Limited {
            retry_after_seconds,
        } = state.rate_limiter().check(ThrottleAction::Login, key)
        {
            return login_error(LoginError::Throttled {
                retry_after_seconds,
            });
        }
    }

    let force_step_up = flag(request.two_factor.as_deref());
    match state
        .login()
        .authenticate(identifier, &request.password, request.next.as_deref(), force_step_up)
        .await
    {
        Ok(LoginOutcome::Authenticated(authenticated)) => signed_in(&state, authenticated),
        Ok(LoginOutcome::AwaitingChallenge(pending)) => challenge_response(pending),
        Err(err) => login_error(err),
    }
}

fn flag(value: Option<&str>) -> bool {
    matches!(
        value.map(str::trim).map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "on" | "yes")
    )
}

/// Seal a session for an authenticated user and set the cookie.
pub(super) fn signed_in(state: &AppState, authenticated: Authenticated) -> Response {
    let claims = state.sessions().claims_for(
        authenticated.user.id,
        authenticated.device_id,
        authenticated.auth_time,
    );
    let token = match state.sessions().encode(&claims) {
        Ok(token) => token,
        Err(err) => return login_error(LoginError::Internal(err)),
    };
    let cookie = match session_cookie(state.config(), &token) {
        Ok(cookie) => cookie,
        Err(err) => {
            error!("Failed to build session cookie: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let mut headers = HeaderMap::new();
    headers.insert(header::SET_COOKIE, cookie);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    let body = LoginResponse::Authenticated {
        user_id: authenticated.user.id,
        next: authenticated.next,
    };
    (StatusCode::OK, headers, Json(body)).into_response()
}

pub(super) fn challenge_response(pending: PendingChallenge) -> Response {
    let body = LoginResponse::Challenge {
        state: pending.state,
        device: pending.device,
        material: pending.material,
        alternatives: pending.alternatives,
        next: pending.next,
    };
    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(body),
    )
        .into_response()
}

fn error_response(status: StatusCode, code: &str, description: Option<&str>) -> Response {
    let body = ErrorResponse {
        error: code.to_string(),
        error_description: description.map(str::to_string),
    };
    (status, Json(body)).into_response()
}

/// Map a login failure to a JSON error. Credential failures all look alike.
pub(super) fn login_error(err: LoginError) -> Response {
    match err {
        LoginError::InvalidCredentials => error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            Some("invalid username or password"),
        ),
        LoginError::Expired => error_response(
            StatusCode::BAD_REQUEST,
            "login_expired",
            Some("login expired, start again"),
        ),
        LoginError::ChallengeFailed => error_response(
            StatusCode::UNAUTHORIZED,
            "access_denied",
            Some("verification failed"),
        ),
        LoginError::MfaEnrollmentRequired => error_response(
            StatusCode::FORBIDDEN,
            "access_denied",
            Some("a confirmed second factor is required"),
        ),
        LoginError::Throttled {
            retry_after_seconds,
        } => {
            let mut response =
                error_response(StatusCode::TOO_MANY_REQUESTS, "too_many_requests", None);
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
        LoginError::Internal(err) => {
            error!("Failed to process login: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
        }
    }
}
