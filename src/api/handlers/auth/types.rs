//! Request/response types for login, MFA and device endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::mfa::{ChallengeMaterial, DeviceSummary};

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct LoginRequest {
    /// Username or email.
    pub identifier: String,
    pub password: String,
    #[serde(default)]
    pub next: Option<String>,
    /// Force a second factor even when the user's profile does not ask for one.
    #[serde(default)]
    pub two_factor: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaVerifyRequest {
    pub state: String,
    #[serde(default)]
    pub device_id: Option<Uuid>,
    pub response: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaChallengeRequest {
    pub state: String,
    #[serde(default)]
    pub device_id: Option<Uuid>,
}

/// Result of a login step.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginResponse {
    /// The session cookie is set; continue at `next`.
    Authenticated { user_id: Uuid, next: String },
    /// Answer the challenge at `/v1/auth/mfa/verify` with `state`.
    Challenge {
        state: String,
        device: DeviceSummary,
        material: ChallengeMaterial,
        alternatives: Vec<DeviceSummary>,
        next: String,
    },
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct LogoutParams {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterTotpRequest {
    pub name: String,
    #[serde(default)]
    pub digits: Option<u32>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpEnrollmentResponse {
    pub device: DeviceSummary,
    /// `otpauth://` URI, shown once.
    pub provisioning_uri: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterOutOfBandRequest {
    pub name: String,
    /// E.164 phone number.
    pub target: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterHardwareKeyRequest {
    pub name: String,
    /// Base64url Ed25519 public key.
    pub public_key: String,
    pub key_handle: String,
    pub app_id: String,
}

/// A pending device and the challenge that confirms it.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DeviceEnrollmentResponse {
    pub device: DeviceSummary,
    pub material: ChallengeMaterial,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ConfirmDeviceRequest {
    pub response: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaPreferenceRequest {
    pub enabled: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct MfaPreferenceResponse {
    pub enabled: bool,
    pub default_device: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn login_response_is_tagged_by_status() -> Result<()> {
        let response = LoginResponse::Authenticated {
            user_id: Uuid::nil(),
            next: "/".to_string(),
        };
        let value = serde_json::to_value(&response)?;
        let status = value
            .get("status")
            .and_then(serde_json::Value::as_str)
            .context("missing status")?;
        assert_eq!(status, "authenticated");
        Ok(())
    }

    #[test]
    fn verify_request_device_is_optional() -> Result<()> {
        let request: MfaVerifyRequest =
            serde_json::from_str(r#"{"state":"s","response":"123456"}"#)?;
        assert_eq!(request.device_id, None);
        Ok(())
    }
}
