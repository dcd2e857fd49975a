//! Random opaque credentials and their storage digests.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

/// Fill `len` bytes from the OS random source.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to read from the OS random source")?;
    Ok(bytes)
}

/// Create a new opaque credential (codes, access and refresh tokens).
///
/// The raw value is only handed to the caller; storage keeps [`digest`].
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_opaque_token() -> Result<String> {
    let bytes = random_bytes(32)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// SHA-256 of an opaque credential, used as its lookup key.
#[must_use]
pub fn digest(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_opaque_token_has_256_bits() {
        let decoded_len = generate_opaque_token()
            .ok()
            .and_then(|token| URL_SAFE_NO_PAD.decode(token.as_bytes()).ok())
            .map(|bytes| bytes.len());
        assert_eq!(decoded_len, Some(32));
    }

    #[test]
    fn generated_tokens_differ() -> Result<()> {
        assert_ne!(generate_opaque_token()?, generate_opaque_token()?);
        Ok(())
    }

    #[test]
    fn digest_stable() {
        let first = digest("token");
        let second = digest("token");
        let different = digest("other");
        assert_eq!(first, second);
        assert_ne!(first, different);
        assert_eq!(first.len(), 32);
    }
}
