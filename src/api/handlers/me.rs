//! Device registry for the signed-in user.
//!
//! Every call resolves the acting user from the session cookie and passes it
//! to the registry explicitly.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use super::auth::current_session;
use super::auth::types::{
    ConfirmDeviceRequest, DeviceEnrollmentResponse, MfaPreferenceRequest, MfaPreferenceResponse,
    RegisterHardwareKeyRequest, RegisterOutOfBandRequest, RegisterTotpRequest,
    TotpEnrollmentResponse,
};
use crate::api::state::AppState;
use crate::mfa::{Device, DeviceError, DeviceSummary, Profile};
use crate::oauth2::ErrorResponse;
use crate::session::SessionClaims;

const DEFAULT_TOTP_DIGITS: u32 = 6;

fn error_response(status: StatusCode, code: &str, description: Option<String>) -> Response {
    let body = ErrorResponse {
        error: code.to_string(),
        error_description: description,
    };
    (status, Json(body)).into_response()
}

fn device_error(err: DeviceError) -> Response {
    match err {
        DeviceError::NotFound => {
            error_response(StatusCode::NOT_FOUND, "not_found", Some(err.to_string()))
        }
        DeviceError::AlreadyConfirmed => {
            error_response(StatusCode::CONFLICT, "already_confirmed", Some(err.to_string()))
        }
        DeviceError::NotConfirmed => {
            error_response(StatusCode::CONFLICT, "not_confirmed", Some(err.to_string()))
        }
        DeviceError::InvalidCode => {
            error_response(StatusCode::BAD_REQUEST, "invalid_code", Some(err.to_string()))
        }
        DeviceError::InvalidInput(message) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", Some(message))
        }
        DeviceError::Store(_) | DeviceError::Internal(_) => {
            error!("Failed to update devices: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
        }
    }
}

fn require_session(state: &AppState, headers: &HeaderMap) -> Result<SessionClaims, Response> {
    current_session(state, headers).ok_or_else(|| {
        error_response(
            StatusCode::UNAUTHORIZED,
            "login_required",
            Some("sign in first".to_string()),
        )
    })
}

async fn summary(state: &AppState, device: &Device) -> Result<DeviceSummary, DeviceError> {
    let profile = state.devices().profile(device.user_id).await?;
    Ok(device.summary(profile.default_device))
}

fn preference(profile: &Profile) -> MfaPreferenceResponse {
    MfaPreferenceResponse {
        enabled: profile.mfa_enabled,
        default_device: profile.default_device,
    }
}

#[utoipa::path(
    get,
    path = "/v1/me/devices",
    responses(
        (status = 200, description = "Registered devices", body = [DeviceSummary]),
        (status = 401, description = "Not signed in", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn list_devices(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let devices = state.devices();
    let result = async {
        let profile = devices.profile(session.sub).await?;
        let listed = devices.list(session.sub).await?;
        Ok::<_, DeviceError>(
            listed
                .iter()
                .map(|device| device.summary(profile.default_device))
                .collect::<Vec<_>>(),
        )
    }
    .await;
    match result {
        Ok(summaries) => (StatusCode::OK, Json(summaries)).into_response(),
        Err(err) => device_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/me/devices/totp",
    request_body = RegisterTotpRequest,
    responses(
        (status = 201, description = "Pending TOTP device", body = TotpEnrollmentResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 401, description = "Not signed in", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn register_totp(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(request): Json<RegisterTotpRequest>,
) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let account = match state.directory().find_user_by_id(session.sub).await {
        Ok(Some(user)) if !user.email.is_empty() => user.email,
        Ok(Some(user)) => user.username,
        Ok(None) => {
            return error_response(StatusCode::UNAUTHORIZED, "login_required", None);
        }
        Err(err) => return device_error(DeviceError::Internal(err)),
    };
    let digits = request.digits.unwrap_or(DEFAULT_TOTP_DIGITS);
    let enrollment = match state
        .devices()
        .register_totp(session.sub, &request.name, digits, &account)
        .await
    {
        Ok(enrollment) => enrollment,
        Err(err) => return device_error(err),
    };
    match summary(&state, &enrollment.device).await {
        Ok(device) => (
            StatusCode::CREATED,
            Json(TotpEnrollmentResponse {
                device,
                provisioning_uri: enrollment.provisioning_uri,
            }),
        )
            .into_response(),
        Err(err) => device_error(err),
    }
}

async fn enrollment_response(state: &AppState, device: Device) -> Response {
    let material = match state.devices().challenges().generate_challenge(&device).await {
        Ok(material) => material,
        Err(err) => return device_error(DeviceError::Internal(err)),
    };
    match summary(state, &device).await {
        Ok(device) => (
            StatusCode::CREATED,
            Json(DeviceEnrollmentResponse { device, material }),
        )
            .into_response(),
        Err(err) => device_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/me/devices/out-of-band",
    request_body = RegisterOutOfBandRequest,
    responses(
        (status = 201, description = "Pending device; a code was sent", body = DeviceEnrollmentResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 401, description = "Not signed in", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn register_out_of_band(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(request): Json<RegisterOutOfBandRequest>,
) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    match state
        .devices()
        .register_out_of_band(session.sub, &request.name, &request.target)
        .await
    {
        Ok(device) => enrollment_response(&state, device).await,
        Err(err) => device_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/me/devices/hardware-key",
    request_body = RegisterHardwareKeyRequest,
    responses(
        (status = 201, description = "Pending device and its first challenge", body = DeviceEnrollmentResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 401, description = "Not signed in", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn register_hardware_key(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(request): Json<RegisterHardwareKeyRequest>,
) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Ok(public_key) = URL_SAFE_NO_PAD.decode(request.public_key.trim()) else {
        return device_error(DeviceError::InvalidInput(
            "public key must be base64url".to_string(),
        ));
    };
    match state
        .devices()
        .register_hardware_key(
            session.sub,
            &request.name,
            public_key,
            &request.key_handle,
            &request.app_id,
        )
        .await
    {
        Ok(device) => enrollment_response(&state, device).await,
        Err(err) => device_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/me/devices/{id}/confirm",
    params(("id" = Uuid, Path, description = "Device id")),
    request_body = ConfirmDeviceRequest,
    responses(
        (status = 200, description = "Device confirmed", body = DeviceSummary),
        (status = 400, description = "Wrong code", body = ErrorResponse),
        (status = 404, description = "Unknown device", body = ErrorResponse),
        (status = 409, description = "Already confirmed", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn confirm_device(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ConfirmDeviceRequest>,
) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let device = match state
        .devices()
        .confirm(session.sub, id, request.response.trim())
        .await
    {
        Ok(device) => device,
        Err(err) => return device_error(err),
    };
    match summary(&state, &device).await {
        Ok(device) => (StatusCode::OK, Json(device)).into_response(),
        Err(err) => device_error(err),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/me/devices/{id}",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 204, description = "Device removed"),
        (status = 404, description = "Unknown device", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn remove_device(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    match state.devices().remove(session.sub, id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => device_error(err),
    }
}

#[utoipa::path(
    put,
    path = "/v1/me/devices/{id}/default",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 200, description = "Default device changed", body = MfaPreferenceResponse),
        (status = 404, description = "Unknown device", body = ErrorResponse),
        (status = 409, description = "Device not confirmed", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn set_default_device(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    match state.devices().set_default(session.sub, id).await {
        Ok(profile) => (StatusCode::OK, Json(preference(&profile))).into_response(),
        Err(err) => device_error(err),
    }
}

#[utoipa::path(
    put,
    path = "/v1/me/mfa",
    request_body = MfaPreferenceRequest,
    responses(
        (status = 200, description = "Preference saved", body = MfaPreferenceResponse),
        (status = 409, description = "No confirmed device", body = ErrorResponse)
    ),
    tag = "devices"
)]
pub async fn set_mfa(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(request): Json<MfaPreferenceRequest>,
) -> Response {
    let session = match require_session(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    if request.enabled {
        match state.devices().default_device(session.sub).await {
            Ok(Some(_)) => {}
            Ok(None) => return device_error(DeviceError::NotConfirmed),
            Err(err) => return device_error(err),
        }
    }
    match state
        .devices()
        .set_mfa_enabled(session.sub, request.enabled)
        .await
    {
        Ok(profile) => (StatusCode::OK, Json(preference(&profile))).into_response(),
        Err(err) => device_error(err),
    }
}
