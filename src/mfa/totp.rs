//! Time-step one-time codes shared by TOTP and out-of-band devices.

use anyhow::{Context, Result, anyhow, ensure};
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, TOTP};

use super::device::TotpParams;

/// Parameters of one verification scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OtpWindow {
    pub step: i64,
    pub t0: i64,
    pub digits: u32,
    pub tolerance: i64,
    pub drift: i64,
    pub last_t: i64,
}

impl From<&TotpParams> for OtpWindow {
    fn from(params: &TotpParams) -> Self {
        Self {
            step: params.step,
            t0: params.t0,
            digits: params.digits,
            tolerance: params.tolerance,
            drift: params.drift,
            last_t: params.last_t,
        }
    }
}

/// Accepted step and the offset it was found at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OtpMatch {
    pub t: i64,
    pub offset: i64,
}

/// Decode a hex secret.
///
/// # Errors
/// Returns an error if the key is not hex.
pub fn decode_key(key_hex: &str) -> Result<Vec<u8>> {
    hex::decode(key_hex.trim()).context("device key is not valid hex")
}

/// Current step for `now` (Unix seconds), without drift.
#[must_use]
pub fn current_step(now: i64, t0: i64, step: i64) -> i64 {
    (now - t0).div_euclid(step.max(1))
}

/// HOTP value for step counter `t`.
///
/// # Errors
/// Returns an error for negative counters, a step below one second or
/// unsupported digit counts.
pub fn code_at(key: &[u8], t: i64, step: i64, digits: u32) -> Result<String> {
    ensure!(step > 0, "invalid step: {step}");
    let counter = u64::try_from(t).map_err(|_| anyhow!("negative time step"))?;
    let step = u64::try_from(step).map_err(|_| anyhow!("invalid step"))?;
    let time = counter
        .checked_mul(step)
        .ok_or_else(|| anyhow!("time step out of range"))?;
    let digits = usize::try_from(digits)?;
    let totp = TOTP::new_unchecked(
        Algorithm::SHA1,
        digits,
        0,
        step,
        key.to_vec(),
        None,
        String::new(),
    );
    Ok(totp.generate(time))
}

/// Only `digits` ASCII digits are worth computing against.
#[must_use]
pub fn well_formed(presented: &str, digits: u32) -> bool {
    usize::try_from(digits).is_ok_and(|digits| presented.len() == digits)
        && presented.bytes().all(|b| b.is_ascii_digit())
}

/// Scan `-tolerance..=tolerance` around the drift-corrected current step and
/// return the first offset whose step is newer than `last_t` and whose code
/// matches.
///
/// # Errors
/// Returns an error if the window has no positive step or code generation
/// fails.
pub fn scan(key: &[u8], window: &OtpWindow, now: i64, presented: &str) -> Result<Option<OtpMatch>> {
    ensure!(window.step > 0, "invalid step: {}", window.step);
    if !well_formed(presented, window.digits) {
        return Ok(None);
    }
    let base = current_step(now, window.t0, window.step) + window.drift;
    for offset in -window.tolerance..=window.tolerance {
        let t = base + offset;
        if t <= window.last_t || t < 0 {
            continue;
        }
        let expected = code_at(key, t, window.step, window.digits)?;
        if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
            return Ok(Some(OtpMatch { t, offset }));
        }
    }
    Ok(None)
}

/// Drift after a match at `offset`, bounded to `±max_drift`.
#[must_use]
pub fn next_drift(drift: i64, offset: i64, max_drift: i64) -> i64 {
    if offset == 0 {
        return drift;
    }
    let max = max_drift.abs();
    (drift + offset).clamp(-max, max)
}

/// `otpauth://` URI for authenticator apps.
///
/// # Errors
/// Returns an error if the key is not hex or the step/digits are invalid.
pub fn provisioning_uri(params: &TotpParams, issuer: &str, account: &str) -> Result<String> {
    ensure!(params.step > 0, "invalid step: {}", params.step);
    let key = decode_key(&params.key)?;
    let totp = TOTP::new_unchecked(
        Algorithm::SHA1,
        usize::try_from(params.digits)?,
        0,
        u64::try_from(params.step).map_err(|_| anyhow!("invalid step"))?,
        key,
        Some(issuer.replace(':', "")),
        account.replace(':', ""),
    );
    Ok(totp.get_url())
}
