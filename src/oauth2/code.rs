//! Authorization codes: issue and single-use redemption.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    client::{Client, ClientRegistry, GrantType},
    error::OAuthError,
    pkce::PkceChallenge,
    scope::ScopeSet,
};
use crate::secret;
use crate::store::{CodeStore, StoreError, TokenStore};

const MAX_INSERT_ATTEMPTS: usize = 3;

/// Persisted authorization code. `code_hash` is the SHA-256 of the raw code.
#[derive(Clone, Debug)]
pub struct AuthorizationCode {
    pub id: Uuid,
    pub code_hash: Vec<u8>,
    pub client_id: String,
    pub user_id: Uuid,
    pub redirect_uri: String,
    pub scopes: ScopeSet,
    pub pkce: Option<PkceChallenge>,
    pub nonce: Option<String>,
    pub device_id: Option<Uuid>,
    pub auth_time: DateTime<Utc>,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct IssueRequest<'a> {
    pub client: &'a Client,
    pub user_id: Uuid,
    pub redirect_uri: &'a str,
    pub scopes: ScopeSet,
    pub pkce: Option<PkceChallenge>,
    pub nonce: Option<String>,
    pub device_id: Option<Uuid>,
    pub auth_time: DateTime<Utc>,
}

/// Identity and grant bound to a successfully redeemed code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedeemedCode {
    /// Family id of every token minted from this code.
    pub family_id: Uuid,
    pub user_id: Uuid,
    pub scopes: ScopeSet,
    pub device_id: Option<Uuid>,
    pub nonce: Option<String>,
    pub auth_time: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CodeEngine {
    codes: Arc<dyn CodeStore>,
    tokens: Arc<dyn TokenStore>,
    ttl: Duration,
    reuse_detection: bool,
}

impl CodeEngine {
    #[must_use]
    pub fn new(codes: Arc<dyn CodeStore>, tokens: Arc<dyn TokenStore>, ttl_seconds: i64) -> Self {
        Self {
            codes,
            tokens,
            ttl: Duration::seconds(ttl_seconds),
            reuse_detection: true,
        }
    }

    #[must_use]
    pub fn with_reuse_detection(mut self, enabled: bool) -> Self {
        self.reuse_detection = enabled;
        self
    }

    /// Issue a new code and return its raw value.
    ///
    /// # Errors
    /// `unauthorized_client`, `invalid_request` (unregistered redirect URI),
    /// `invalid_scope`, or `server_error`.
    pub async fn issue(&self, request: IssueRequest<'_>) -> Result<String, OAuthError> {
        let client = request.client;
        ClientRegistry::ensure_grant(client, GrantType::AuthorizationCode)?;
        if !client.validate_redirect(request.redirect_uri) {
            return Err(OAuthError::InvalidRequest(
                "redirect_uri is not registered".to_string(),
            ));
        }
        if !request.scopes.is_subset(&client.scopes) {
            let missing = request.scopes.missing_from(&client.scopes).join(" ");
            return Err(OAuthError::InvalidScope(format!(
                "scope not allowed for client: {missing}"
            )));
        }

        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let code = secret::generate_opaque_token()?;
            let record = AuthorizationCode {
                id: Uuid::new_v4(),
                code_hash: secret::digest(&code),
                client_id: client.client_id.clone(),
                user_id: request.user_id,
                redirect_uri: request.redirect_uri.to_string(),
                scopes: request.scopes.clone(),
                pkce: request.pkce.clone(),
                nonce: request.nonce.clone(),
                device_id: request.device_id,
                auth_time: request.auth_time,
                is_valid: true,
                created_at: Utc::now(),
            };
            match self.codes.insert_code(&record).await {
                Ok(()) => {
                    debug!(client_id = %client.client_id, code_id = %record.id, "authorization code issued");
                    return Ok(code);
                }
                Err(StoreError::Conflict) => {
                    warn!(attempt, "authorization code collision, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(OAuthError::server(anyhow::anyhow!(
            "could not store a unique authorization code"
        )))
    }

    /// Redeem a code exactly once. The code is invalidated by the first
    /// attempt whatever its outcome.
    ///
    /// # Errors
    /// `invalid_grant` for any mismatch, replay or expiry.
    pub async fn redeem(
        &self,
        code: &str,
        client: &Client,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<RedeemedCode, OAuthError> {
        if code.is_empty() {
            return Err(OAuthError::InvalidRequest("missing code".to_string()));
        }
        let Some(record) = self.codes.take_code(&secret::digest(code)).await? else {
            return Err(invalid_code());
        };

        if !record.is_valid {
            warn!(client_id = %client.client_id, code_id = %record.id, "authorization code replayed");
            if self.reuse_detection {
                let revoked = self.tokens.revoke_family(record.id).await?;
                warn!(code_id = %record.id, revoked, "revoked tokens minted from replayed code");
            }
            return Err(invalid_code());
        }
        if Utc::now() - record.created_at > self.ttl {
            debug!(code_id = %record.id, "authorization code expired");
            return Err(invalid_code());
        }
        if record.client_id != client.client_id {
            warn!(code_id = %record.id, client_id = %client.client_id, "authorization code presented by another client");
            return Err(invalid_code());
        }
        if record.redirect_uri != redirect_uri {
            return Err(OAuthError::InvalidGrant("redirect_uri mismatch".to_string()));
        }
        match (&record.pkce, code_verifier) {
            (Some(pkce), Some(verifier)) if pkce.verify(verifier) => {}
            (None, None) => {}
            _ => {
                return Err(OAuthError::InvalidGrant(
                    "code_verifier does not match".to_string(),
                ));
            }
        }

        Ok(RedeemedCode {
            family_id: record.id,
            user_id: record.user_id,
            scopes: record.scopes,
            device_id: record.device_id,
            nonce: record.nonce,
            auth_time: record.auth_time,
        })
    }
}

fn invalid_code() -> OAuthError {
    OAuthError::InvalidGrant("invalid authorization code".to_string())
}
