//! Signed, versioned, stateless tokens.
//!
//! Wire format: `v1.<base64url(json)>.<base64url(hmac)>`, where the MAC
//! covers `v1.<payload>`. Decoding never returns partial claims.

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use utoipa::ToSchema;
use uuid::Uuid;

use super::signer::Signer;

pub const CLAIMS_VERSION: u8 = 1;
const PREFIX: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported token version")]
    UnsupportedVersion,
    #[error("signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token issued by another issuer")]
    WrongIssuer,
}

/// Sign `claims` into the wire format.
///
/// # Errors
/// Returns an error if serialization or signing fails.
pub fn seal<T: Serialize>(signer: &Signer, claims: &T) -> Result<String> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signed = format!("{PREFIX}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(signer.sign(signed.as_bytes())?);
    Ok(format!("{signed}.{signature}"))
}

/// Verify and parse a sealed token. Expiry is left to the caller.
///
/// # Errors
/// Returns the first failed check.
pub fn open<T: DeserializeOwned>(signer: &Signer, token: &str) -> Result<T, DecodeError> {
    let mut parts = token.split('.');
    let (Some(version), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(DecodeError::Malformed);
    };
    if version != PREFIX {
        return Err(DecodeError::UnsupportedVersion);
    }
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| DecodeError::Malformed)?;
    let signed_len = version.len() + 1 + payload.len();
    let signed = token.get(..signed_len).ok_or(DecodeError::Malformed)?;
    if !signer.verify(signed.as_bytes(), &signature) {
        return Err(DecodeError::BadSignature);
    }
    let json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| DecodeError::Malformed)?;
    serde_json::from_slice(&json).map_err(|_| DecodeError::Malformed)
}

/// Claims carried by the session cookie.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub ver: u8,
    pub sub: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<Uuid>,
    pub iat: i64,
    pub auth_time: i64,
    pub exp: i64,
    pub iss: String,
}

impl SessionClaims {
    #[must_use]
    pub fn auth_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.auth_time, 0).unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct SessionCodec {
    signer: Signer,
    issuer: String,
    ttl_seconds: i64,
}

impl SessionCodec {
    #[must_use]
    pub fn new(signer: Signer, issuer: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            signer,
            issuer: issuer.into(),
            ttl_seconds,
        }
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// Claims for a session starting now.
    #[must_use]
    pub fn claims_for(&self, user_id: Uuid, device_id: Option<Uuid>, auth_time: DateTime<Utc>) -> SessionClaims {
        let now = Utc::now().timestamp();
        SessionClaims {
            ver: CLAIMS_VERSION,
            sub: user_id,
            dev: device_id,
            iat: now,
            auth_time: auth_time.timestamp(),
            exp: now + self.ttl_seconds,
            iss: self.issuer.clone(),
        }
    }

    /// # Errors
    /// Returns an error if signing fails.
    pub fn encode(&self, claims: &SessionClaims) -> Result<String> {
        seal(&self.signer, claims)
    }

    /// # Errors
    /// Any structural, signature, version, expiry or issuer failure.
    pub fn decode(&self, token: &str) -> Result<SessionClaims, DecodeError> {
        let claims: SessionClaims = open(&self.signer, token)?;
        if claims.ver != CLAIMS_VERSION {
            return Err(DecodeError::UnsupportedVersion);
        }
        if claims.exp <= Utc::now().timestamp() {
            return Err(DecodeError::Expired);
        }
        if claims.iss != self.issuer {
            return Err(DecodeError::WrongIssuer);
        }
        Ok(claims)
    }
}
