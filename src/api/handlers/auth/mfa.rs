//! Second step of the login: answer or re-issue a challenge.

use axum::{Form, extract::Extension, response::Response};
use std::sync::Arc;

use super::login::{challenge_response, login_error, signed_in};
use super::types::{LoginResponse, MfaChallengeRequest, MfaVerifyRequest};
use crate::api::state::AppState;
use crate::oauth2::ErrorResponse;

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/verify",
    request_body(content = MfaVerifyRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Signed in with a second factor", body = LoginResponse),
        (status = 400, description = "Login state expired or tampered", body = ErrorResponse),
        (status = 401, description = "Response rejected", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn verify(state: Extension<Arc<AppState>>, Form(request): Form<MfaVerifyRequest>) -> Response {
    match state
        .login()
        .verify_challenge(&request.state, request.device_id, request.response.trim())
        .await
    {
        Ok(authenticated) => signed_in(&state, authenticated),
        Err(err) => login_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/challenge",
    request_body(content = MfaChallengeRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "New challenge issued", body = LoginResponse),
        (status = 400, description = "Login state expired or tampered", body = ErrorResponse),
        (status = 401, description = "Device unavailable", body = ErrorResponse),
        (status = 429, description = "Too many challenges requested", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn challenge(
    state: Extension<Arc<AppState>>,
    Form(request): Form<MfaChallengeRequest>,
) -> Response {
    match state
        .login()
        .resend_challenge(&request.state, request.device_id)
        .await
    {
        Ok(pending) => challenge_response(pending),
        Err(err) => login_error(err),
    }
}
