//! Proof Key for Code Exchange (RFC 7636).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use subtle::ConstantTimeEq;

use super::error::OAuthError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[default]
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "S256")]
    S256,
}

impl CodeChallengeMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::S256 => "S256",
        }
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = OAuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "plain" => Ok(Self::Plain),
            "S256" => Ok(Self::S256),
            other => Err(OAuthError::InvalidRequest(format!(
                "unsupported code_challenge_method: {other}"
            ))),
        }
    }
}

/// A challenge bound to an authorization code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    pub challenge: String,
    pub method: CodeChallengeMethod,
}

/// `code-verifier = 43*128unreserved`
fn is_valid_verifier(value: &str) -> bool {
    (43..=128).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

impl PkceChallenge {
    /// Build a challenge from the `/authorize` parameters. The method
    /// defaults to `plain` when absent.
    ///
    /// # Errors
    /// `invalid_request` for an unknown method or a malformed challenge.
    pub fn from_request(challenge: &str, method: Option<&str>) -> Result<Self, OAuthError> {
        let method = match method {
            Some(value) if !value.is_empty() => value.parse()?,
            _ => CodeChallengeMethod::Plain,
        };
        if !is_valid_verifier(challenge) {
            return Err(OAuthError::InvalidRequest(
                "malformed code_challenge".to_string(),
            ));
        }
        Ok(Self {
            challenge: challenge.to_string(),
            method,
        })
    }

    /// Recompute the challenge from `verifier` and compare in constant time.
    #[must_use]
    pub fn verify(&self, verifier: &str) -> bool {
        if !is_valid_verifier(verifier) {
            return false;
        }
        let computed = match self.method {
            CodeChallengeMethod::Plain => verifier.to_string(),
            CodeChallengeMethod::S256 => s256(verifier),
        };
        computed
            .as_bytes()
            .ct_eq(self.challenge.as_bytes())
            .into()
    }
}

/// `BASE64URL(SHA256(ASCII(code_verifier)))`
#[must_use]
pub fn s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    // RFC 7636 appendix B
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn s256_matches_rfc_vector() {
        assert_eq!(s256(VERIFIER), CHALLENGE);
    }

    #[test]
    fn method_defaults_to_plain() -> Result<()> {
        let pkce = PkceChallenge::from_request(VERIFIER, None)?;
        assert_eq!(pkce.method, CodeChallengeMethod::Plain);
        assert!(pkce.verify(VERIFIER));
        Ok(())
    }

    #[test]
    fn s256_verification() -> Result<()> {
        let pkce = PkceChallenge::from_request(CHALLENGE, Some("S256"))?;
        assert!(pkce.verify(VERIFIER));
        assert!(!pkce.verify(CHALLENGE));
        assert!(!pkce.verify(&format!("{VERIFIER}x")));
        Ok(())
    }

    #[test]
    fn rejects_unknown_method_and_short_challenge() {
        assert!(PkceChallenge::from_request(CHALLENGE, Some("S512")).is_err());
        assert!(PkceChallenge::from_request("short", Some("S256")).is_err());
    }

    #[test]
    fn rejects_malformed_verifier() -> Result<()> {
        let pkce = PkceChallenge::from_request(CHALLENGE, Some("S256"))?;
        assert!(!pkce.verify("too-short"));
        Ok(())
    }
}
