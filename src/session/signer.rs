//! Signing key material and per-purpose HMAC keys.
//!
//! One master key is configured. Each consumer (session cookies, login
//! state blobs, ID tokens) derives its own 32-byte key as
//! `HMAC-SHA256(master, purpose)`, so a value signed for one purpose never
//! verifies for another.

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_KEY_BYTES: usize = 32;

pub const PURPOSE_SESSION: &str = "sso.session";
pub const PURPOSE_LOGIN_STATE: &str = "sso.login-state";
pub const PURPOSE_ID_TOKEN: &str = "sso.id-token";

/// Configured signing keys. The previous key is only used to verify.
#[derive(Clone)]
pub struct KeyMaterial {
    current: SecretString,
    previous: Option<SecretString>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("current", &"***")
            .field("previous", &self.previous.as_ref().map(|_| "***"))
            .finish()
    }
}

fn decode_key(label: &str, value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim();
    let bytes = STANDARD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .with_context(|| format!("{label} is not valid base64"))?;
    if bytes.len() < MIN_KEY_BYTES {
        bail!("{label} must decode to at least {MIN_KEY_BYTES} bytes");
    }
    Ok(bytes)
}

impl KeyMaterial {
    /// Parse base64 key material.
    ///
    /// # Errors
    /// Returns an error if a key is not base64 or shorter than 32 bytes.
    pub fn from_base64(current: &str, previous: Option<&str>) -> Result<Self> {
        decode_key("signing key", current)?;
        if let Some(previous) = previous {
            decode_key("previous signing key", previous)?;
        }
        Ok(Self {
            current: SecretString::from(current.trim().to_string()),
            previous: previous.map(|value| SecretString::from(value.trim().to_string())),
        })
    }

    /// Build from raw bytes.
    ///
    /// # Errors
    /// Returns an error if the key is shorter than 32 bytes.
    pub fn from_bytes(current: &[u8]) -> Result<Self> {
        Self::from_base64(&STANDARD.encode(current), None)
    }

    /// Derive the key pair for `purpose`.
    ///
    /// # Errors
    /// Returns an error if stored material no longer decodes.
    pub fn derive(&self, purpose: &str) -> Result<DerivedKeys> {
        let current = decode_key("signing key", self.current.expose_secret())?;
        let previous = self
            .previous
            .as_ref()
            .map(|value| decode_key("previous signing key", value.expose_secret()))
            .transpose()?;
        Ok(DerivedKeys {
            current: derive_key(&current, purpose)?,
            previous: previous
                .map(|key| derive_key(&key, purpose))
                .transpose()?,
        })
    }
}

fn derive_key(master: &[u8], purpose: &str) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(master).context("invalid HMAC key")?;
    mac.update(purpose.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

#[derive(Clone)]
pub struct DerivedKeys {
    current: [u8; 32],
    previous: Option<[u8; 32]>,
}

impl DerivedKeys {
    #[must_use]
    pub fn current(&self) -> &[u8; 32] {
        &self.current
    }
}

/// HMAC-SHA256 signer over a derived key pair.
#[derive(Clone)]
pub struct Signer {
    keys: DerivedKeys,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    #[must_use]
    pub fn new(keys: DerivedKeys) -> Self {
        Self { keys }
    }

    /// # Errors
    /// Returns an error if the MAC cannot be keyed.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        mac(&self.keys.current, message)
    }

    /// Constant-time check against the current key, then the previous one.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let check = |key: &[u8; 32]| {
            HmacSha256::new_from_slice(key).is_ok_and(|mut mac| {
                mac.update(message);
                mac.verify_slice(signature).is_ok()
            })
        };
        check(&self.keys.current) || self.keys.previous.as_ref().is_some_and(check)
    }
}

fn mac(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).context("invalid HMAC key")?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}
