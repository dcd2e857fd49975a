//! Out-of-band (SMS) one-time codes.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use super::device::{
    OUT_OF_BAND_DIGITS, OUT_OF_BAND_STEP, OUT_OF_BAND_TOLERANCE, OutOfBandParams,
};
use super::totp::{self, OtpWindow};
use crate::notify::Notification;

static E164: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^\+[1-9][0-9]{6,14}$").ok());

/// Phone numbers must be in E.164 form.
#[must_use]
pub fn valid_target(target: &str) -> bool {
    E164.as_ref().is_some_and(|regex| regex.is_match(target))
}

#[must_use]
pub fn window(params: &OutOfBandParams) -> OtpWindow {
    OtpWindow {
        step: OUT_OF_BAND_STEP,
        t0: 0,
        digits: OUT_OF_BAND_DIGITS,
        tolerance: OUT_OF_BAND_TOLERANCE,
        drift: 0,
        last_t: params.last_t,
    }
}

/// Code valid for the window containing `now`.
///
/// # Errors
/// Returns an error if the key is not hex.
pub fn current_code(params: &OutOfBandParams, now: i64) -> Result<String> {
    let key = totp::decode_key(&params.key)?;
    let t = totp::current_step(now, 0, OUT_OF_BAND_STEP);
    totp::code_at(&key, t, OUT_OF_BAND_STEP, OUT_OF_BAND_DIGITS)
}

/// SMS carrying the current code.
///
/// # Errors
/// Returns an error if the key is not hex.
pub fn message(params: &OutOfBandParams, issuer_name: &str, now: i64) -> Result<Notification> {
    let code = current_code(params, now)?;
    Ok(Notification {
        receipt: Uuid::new_v4(),
        to: params.target.clone(),
        body: format!("{code} is your {issuer_name} verification code."),
    })
}
