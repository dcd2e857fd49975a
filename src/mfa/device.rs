//! MFA device records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub const TOTP_DEFAULT_STEP: i64 = 30;
pub const TOTP_DEFAULT_DIGITS: u32 = 6;
pub const TOTP_DEFAULT_TOLERANCE: i64 = 1;
/// Out-of-band codes are valid for one 300 s window either side.
pub const OUT_OF_BAND_STEP: i64 = 300;
pub const OUT_OF_BAND_DIGITS: u32 = 6;
pub const OUT_OF_BAND_TOLERANCE: i64 = 1;
pub const HARDWARE_KEY_VERSION: &str = "U2F_V2";
/// No step accepted yet.
pub const INITIAL_LAST_T: i64 = -1;

#[derive(Clone, PartialEq, Eq)]
pub struct TotpParams {
    /// Shared secret, hex encoded.
    pub key: String,
    pub step: i64,
    pub t0: i64,
    pub digits: u32,
    pub tolerance: i64,
    pub drift: i64,
    pub last_t: i64,
}

impl TotpParams {
    #[must_use]
    pub fn new(key_hex: String, digits: u32) -> Self {
        Self {
            key: key_hex,
            step: TOTP_DEFAULT_STEP,
            t0: 0,
            digits,
            tolerance: TOTP_DEFAULT_TOLERANCE,
            drift: 0,
            last_t: INITIAL_LAST_T,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct OutOfBandParams {
    /// E.164 phone number.
    pub target: String,
    pub key: String,
    pub last_t: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareKeyParams {
    pub public_key: Vec<u8>,
    pub key_handle: String,
    pub app_id: String,
    pub version: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Totp(TotpParams),
    OutOfBand(OutOfBandParams),
    HardwareKey(HardwareKeyParams),
}

impl std::fmt::Debug for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Totp(params) => f
                .debug_struct("Totp")
                .field("key", &"***")
                .field("step", &params.step)
                .field("digits", &params.digits)
                .field("drift", &params.drift)
                .field("last_t", &params.last_t)
                .finish_non_exhaustive(),
            Self::OutOfBand(params) => f
                .debug_struct("OutOfBand")
                .field("target", &mask_target(&params.target))
                .field("key", &"***")
                .field("last_t", &params.last_t)
                .finish(),
            Self::HardwareKey(params) => f
                .debug_struct("HardwareKey")
                .field("key_handle", &params.key_handle)
                .field("app_id", &params.app_id)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Totp,
    OutOfBand,
    HardwareKey,
}

impl DeviceType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::OutOfBand => "out_of_band",
            Self::HardwareKey => "hardware_key",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "totp" => Some(Self::Totp),
            "out_of_band" => Some(Self::OutOfBand),
            "hardware_key" => Some(Self::HardwareKey),
            _ => None,
        }
    }
}

/// What the login form should ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoginFormKind {
    OneTimeCode,
    Assertion,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub order: i32,
    pub kind: DeviceKind,
}

impl Device {
    #[must_use]
    pub fn new(user_id: Uuid, name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            confirmed: false,
            created_at: Utc::now(),
            last_used: None,
            order: 0,
            kind,
        }
    }

    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        match self.kind {
            DeviceKind::Totp(_) => DeviceType::Totp,
            DeviceKind::OutOfBand(_) => DeviceType::OutOfBand,
            DeviceKind::HardwareKey(_) => DeviceType::HardwareKey,
        }
    }

    #[must_use]
    pub fn login_form_kind(&self) -> LoginFormKind {
        match self.kind {
            DeviceKind::Totp(_) | DeviceKind::OutOfBand(_) => LoginFormKind::OneTimeCode,
            DeviceKind::HardwareKey(_) => LoginFormKind::Assertion,
        }
    }

    /// `amr` value for tokens bound to this device.
    #[must_use]
    pub fn amr(&self) -> &'static str {
        match self.kind {
            DeviceKind::Totp(_) | DeviceKind::OutOfBand(_) => "otp",
            DeviceKind::HardwareKey(_) => "hwk",
        }
    }

    /// Step counter of one-time-code devices.
    #[must_use]
    pub fn last_t(&self) -> Option<i64> {
        match &self.kind {
            DeviceKind::Totp(params) => Some(params.last_t),
            DeviceKind::OutOfBand(params) => Some(params.last_t),
            DeviceKind::HardwareKey(_) => None,
        }
    }

    #[must_use]
    pub fn summary(&self, default_device: Option<Uuid>) -> DeviceSummary {
        DeviceSummary {
            id: self.id,
            name: self.name.clone(),
            device_type: self.device_type(),
            form: self.login_form_kind(),
            confirmed: self.confirmed,
            is_default: default_device == Some(self.id),
            created_at: self.created_at,
            last_used: self.last_used,
        }
    }
}

/// Public view of a device.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub id: Uuid,
    pub name: String,
    pub device_type: DeviceType,
    pub form: LoginFormKind,
    pub confirmed: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Per-user MFA preferences.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    pub user_id: Uuid,
    pub default_device: Option<Uuid>,
    pub mfa_enabled: bool,
}

impl Profile {
    #[must_use]
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }
}

/// Compare-and-swap update of a device's step counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterUpdate {
    pub device_id: Uuid,
    pub user_id: Uuid,
    /// `None` for devices without a step counter.
    pub expected_last_t: Option<i64>,
    pub last_t: Option<i64>,
    pub drift: Option<i64>,
    pub last_used: DateTime<Utc>,
    pub confirm: bool,
}

/// `+15551234567` becomes `******4567`.
#[must_use]
pub fn mask_target(target: &str) -> String {
    let chars: Vec<char> = target.chars().collect();
    let visible = chars.len().min(4);
    let hidden = chars.len().saturating_sub(visible).max(2);
    let tail: String = chars[chars.len() - visible..].iter().collect();
    format!("{}{tail}", "*".repeat(hidden))
}
