//! OIDC ID tokens signed with Ed25519 (`alg: EdDSA`).

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer as _, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::session::signer::{KeyMaterial, PURPOSE_ID_TOKEN};

pub const ACR_TWO_FACTOR: &str = "two_factor";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub auth_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    pub amr: Vec<String>,
}

/// One entry of the `/jwks` document.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    pub kid: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Inputs for one ID token.
#[derive(Debug, Clone)]
pub struct IdTokenRequest<'a> {
    pub client_id: &'a str,
    pub user_id: Uuid,
    pub auth_time: DateTime<Utc>,
    pub nonce: Option<&'a str>,
    /// Method of the second factor used, if any (`otp`, `hwk`).
    pub second_factor: Option<&'a str>,
}

#[derive(Clone)]
pub struct IdTokenSigner {
    key: SigningKey,
    kid: String,
    issuer: String,
    ttl_seconds: i64,
}

impl std::fmt::Debug for IdTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdTokenSigner")
            .field("kid", &self.kid)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl IdTokenSigner {
    /// # Errors
    /// Returns an error if the key material cannot be derived.
    pub fn new(material: &KeyMaterial, issuer: impl Into<String>, ttl_seconds: i64) -> Result<Self> {
        let derived = material
            .derive(PURPOSE_ID_TOKEN)
            .context("failed to derive ID token key")?;
        let key = SigningKey::from_bytes(derived.current());
        let public = key.verifying_key().to_bytes();
        let kid = URL_SAFE_NO_PAD.encode(&Sha256::digest(public)[..8]);
        Ok(Self {
            key,
            kid,
            issuer: issuer.into(),
            ttl_seconds,
        })
    }

    #[must_use]
    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: vec![Jwk {
                kty: "OKP".to_string(),
                crv: "Ed25519".to_string(),
                x: URL_SAFE_NO_PAD.encode(self.key.verifying_key().to_bytes()),
                key_use: "sig".to_string(),
                alg: "EdDSA".to_string(),
                kid: self.kid.clone(),
            }],
        }
    }

    #[must_use]
    pub fn claims(&self, request: &IdTokenRequest<'_>) -> IdTokenClaims {
        let now = Utc::now().timestamp();
        let mut amr = vec!["pwd".to_string()];
        let acr = request.second_factor.map(|method| {
            amr.push(method.to_string());
            amr.push("mfa".to_string());
            ACR_TWO_FACTOR.to_string()
        });
        IdTokenClaims {
            iss: self.issuer.clone(),
            sub: request.user_id.to_string(),
            aud: request.client_id.to_string(),
            iat: now,
            exp: now + self.ttl_seconds,
            auth_time: request.auth_time.timestamp(),
            nonce: request.nonce.map(str::to_string),
            acr,
            amr,
        }
    }

    /// Sign a compact JWS.
    ///
    /// # Errors
    /// Returns an error if claims cannot be serialized.
    pub fn sign(&self, request: &IdTokenRequest<'_>) -> Result<String> {
        let header = serde_json::json!({"alg": "EdDSA", "typ": "JWT", "kid": self.kid});
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&self.claims(request))?);
        let signing_input = format!("{header}.{claims}");
        let signature = self.key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use base64::engine::general_purpose::STANDARD;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    fn signer() -> Result<IdTokenSigner> {
        let material = KeyMaterial::from_base64(&STANDARD.encode([5u8; 32]), None)?;
        IdTokenSigner::new(&material, "https://sso.example.com", 3600)
    }

    #[test]
    fn signature_verifies_with_published_key() -> Result<()> {
        let signer = signer()?;
        let user_id = Uuid::new_v4();
        let token = signer.sign(&IdTokenRequest {
            client_id: "web",
            user_id,
            auth_time: Utc::now(),
            nonce: Some("abc"),
            second_factor: Some("otp"),
        })?;
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            bail!("expected three JWS segments");
        }

        let jwks = signer.jwks();
        let x = URL_SAFE_NO_PAD.decode(&jwks.keys[0].x)?;
        let Ok(x) = <[u8; 32]>::try_from(x.as_slice()) else {
            bail!("bad key length");
        };
        let key = VerifyingKey::from_bytes(&x)?;
        let signature = Signature::from_slice(&URL_SAFE_NO_PAD.decode(parts[2])?)?;
        key.verify(format!("{}.{}", parts[0], parts[1]).as_bytes(), &signature)?;

        let claims: IdTokenClaims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1])?)?;
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.aud, "web");
        assert_eq!(claims.nonce.as_deref(), Some("abc"));
        assert_eq!(claims.acr.as_deref(), Some(ACR_TWO_FACTOR));
        assert!(claims.amr.contains(&"otp".to_string()));
        Ok(())
    }

    #[test]
    fn single_factor_has_no_acr() -> Result<()> {
        let claims = signer()?.claims(&IdTokenRequest {
            client_id: "web",
            user_id: Uuid::new_v4(),
            auth_time: Utc::now(),
            nonce: None,
            second_factor: None,
        });
        assert_eq!(claims.acr, None);
        assert_eq!(claims.amr, vec!["pwd".to_string()]);
        Ok(())
    }

    #[test]
    fn key_id_is_stable() -> Result<()> {
        assert_eq!(signer()?.jwks(), signer()?.jwks());
        Ok(())
    }
}
