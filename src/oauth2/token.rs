//! Bearer and refresh tokens: minting, validation, rotation, revocation and
//! introspection.
//!
//! Every token minted from one authorization (a code, a client-credentials
//! or password grant) shares a `family_id`. Rotation keeps the family, so a
//! replayed refresh token can take the whole lineage down with it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{client::Client, error::OAuthError, scope::ScopeSet};
use crate::secret;
use crate::store::{StoreError, TokenStore};

const MAX_INSERT_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BearerRecord {
    pub token_hash: Vec<u8>,
    pub client_id: String,
    pub user_id: Uuid,
    pub scopes: ScopeSet,
    pub device_id: Option<Uuid>,
    pub family_id: Uuid,
    /// When the user last signed in; survives refresh rotation.
    pub auth_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Refresh token owned by exactly one bearer token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshRecord {
    pub token_hash: Vec<u8>,
    pub bearer_hash: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Input of the atomic refresh rotation.
#[derive(Clone, Debug)]
pub struct RotateRequest {
    pub refresh_hash: Vec<u8>,
    pub client_id: String,
    /// Refresh tokens created before this instant are expired. Tombstones
    /// older than it are pruned.
    pub not_before: DateTime<Utc>,
    pub new_bearer_hash: Vec<u8>,
    pub new_refresh_hash: Vec<u8>,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RotateOutcome {
    /// New bearer record; the new refresh token belongs to it.
    Rotated(BearerRecord),
    NotFound,
    Reused { family_id: Uuid },
    ClientMismatch,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BearerStatus {
    Active(BearerRecord),
    Expired,
    NotFound,
}

/// Freshly minted credentials. Raw values exist only here.
#[derive(Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub grant: BearerRecord,
}

impl std::fmt::Debug for IssuedTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedTokens")
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expires_in", &self.expires_in)
            .field("grant", &self.grant)
            .finish()
    }
}

/// RFC 7662 introspection response.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Introspection {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl Introspection {
    #[must_use]
    pub fn inactive() -> Self {
        Self::default()
    }
}

/// What the new tokens are bound to.
#[derive(Clone, Debug)]
pub struct MintRequest {
    pub client_id: String,
    pub user_id: Uuid,
    pub scopes: ScopeSet,
    pub device_id: Option<Uuid>,
    /// `None` starts a new family.
    pub family_id: Option<Uuid>,
    pub auth_time: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenEngine {
    store: Arc<dyn TokenStore>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    reuse_detection: bool,
}

impl TokenEngine {
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, access_ttl_seconds: i64, refresh_ttl_seconds: i64) -> Self {
        Self {
            store,
            access_ttl: Duration::seconds(access_ttl_seconds),
            refresh_ttl: Duration::seconds(refresh_ttl_seconds),
            reuse_detection: true,
        }
    }

    #[must_use]
    pub fn with_reuse_detection(mut self, enabled: bool) -> Self {
        self.reuse_detection = enabled;
        self
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    /// Mint a bearer token and its refresh token.
    ///
    /// # Errors
    /// `server_error` if randomness or storage fails.
    pub async fn mint_pair(&self, request: MintRequest) -> Result<IssuedTokens, OAuthError> {
        self.mint(request, true).await
    }

    /// Mint a bearer token without a refresh token (client credentials).
    ///
    /// # Errors
    /// `server_error` if randomness or storage fails.
    pub async fn mint_bearer(&self, request: MintRequest) -> Result<IssuedTokens, OAuthError> {
        self.mint(request, false).await
    }

    async fn mint(&self, request: MintRequest, with_refresh: bool) -> Result<IssuedTokens, OAuthError> {
        let family_id = request.family_id.unwrap_or_else(Uuid::new_v4);
        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let access_token = secret::generate_opaque_token()?;
            let now = Utc::now();
            let bearer = BearerRecord {
                token_hash: secret::digest(&access_token),
                client_id: request.client_id.clone(),
                user_id: request.user_id,
                scopes: request.scopes.clone(),
                device_id: request.device_id,
                family_id,
                auth_time: request.auth_time,
                created_at: now,
            };
            let (refresh_token, refresh) = if with_refresh {
                let raw = secret::generate_opaque_token()?;
                let record = RefreshRecord {
                    token_hash: secret::digest(&raw),
                    bearer_hash: bearer.token_hash.clone(),
                    created_at: now,
                };
                (Some(raw), Some(record))
            } else {
                (None, None)
            };

            match self.store.insert_tokens(&bearer, refresh.as_ref()).await {
                Ok(()) => {
                    debug!(
                        client_id = %bearer.client_id,
                        family_id = %family_id,
                        refresh = with_refresh,
                        "tokens minted"
                    );
                    return Ok(IssuedTokens {
                        access_token,
                        refresh_token,
                        expires_in: self.access_ttl.num_seconds(),
                        grant: bearer,
                    });
                }
                Err(StoreError::Conflict) => warn!(attempt, "token collision, retrying"),
                Err(err) => return Err(err.into()),
            }
        }
        Err(OAuthError::server(anyhow::anyhow!("could not store unique tokens")))
    }

    /// Look up a bearer token and check its age.
    ///
    /// # Errors
    /// `server_error` on storage failure.
    pub async fn validate_bearer(&self, token: &str) -> Result<BearerStatus, OAuthError> {
        if token.is_empty() {
            return Ok(BearerStatus::NotFound);
        }
        let Some(record) = self.store.find_bearer(&secret::digest(token)).await? else {
            return Ok(BearerStatus::NotFound);
        };
        if record.created_at + self.access_ttl <= Utc::now() {
            return Ok(BearerStatus::Expired);
        }
        Ok(BearerStatus::Active(record))
    }

    /// Exchange a refresh token for a new pair. The old pair is gone
    /// afterwards and replaying it fails.
    ///
    /// # Errors
    /// `invalid_grant` for unknown, expired, replayed or foreign tokens.
    pub async fn rotate(&self, refresh_token: &str, client: &Client) -> Result<IssuedTokens, OAuthError> {
        if refresh_token.is_empty() {
            return Err(OAuthError::InvalidRequest(
                "missing refresh_token".to_string(),
            ));
        }
        let refresh_hash = secret::digest(refresh_token);

        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let access_token = secret::generate_opaque_token()?;
            let new_refresh = secret::generate_opaque_token()?;
            let now = Utc::now();
            let request = RotateRequest {
                refresh_hash: refresh_hash.clone(),
                client_id: client.client_id.clone(),
                not_before: now - self.refresh_ttl,
                new_bearer_hash: secret::digest(&access_token),
                new_refresh_hash: secret::digest(&new_refresh),
                now,
            };
            match self.store.rotate_refresh(&request).await {
                Ok(RotateOutcome::Rotated(grant)) => {
                    debug!(client_id = %client.client_id, family_id = %grant.family_id, "refresh token rotated");
                    return Ok(IssuedTokens {
                        access_token,
                        refresh_token: Some(new_refresh),
                        expires_in: self.access_ttl.num_seconds(),
                        grant,
                    });
                }
                Ok(RotateOutcome::Reused { family_id }) => {
                    warn!(client_id = %client.client_id, family_id = %family_id, "rotated refresh token replayed");
                    if self.reuse_detection {
                        let revoked = self.store.revoke_family(family_id).await?;
                        warn!(family_id = %family_id, revoked, "token family revoked");
                    }
                    return Err(invalid_refresh());
                }
                Ok(RotateOutcome::ClientMismatch) => {
                    warn!(client_id = %client.client_id, "refresh token presented by another client");
                    return Err(invalid_refresh());
                }
                Ok(RotateOutcome::Expired) => {
                    return Err(OAuthError::InvalidGrant("refresh token expired".to_string()));
                }
                Ok(RotateOutcome::NotFound) => return Err(invalid_refresh()),
                Err(StoreError::Conflict) => warn!(attempt, "token collision, retrying"),
                Err(err) => return Err(err.into()),
            }
        }
        Err(OAuthError::server(anyhow::anyhow!("could not store unique tokens")))
    }

    /// Revoke a bearer or refresh token owned by `client`. Unknown tokens
    /// and tokens of other clients are ignored.
    ///
    /// # Errors
    /// `server_error` on storage failure.
    pub async fn revoke(&self, token: &str, client: &Client) -> Result<(), OAuthError> {
        if token.is_empty() {
            return Ok(());
        }
        let revoked = self
            .store
            .revoke(&secret::digest(token), &client.client_id)
            .await?;
        debug!(client_id = %client.client_id, revoked, "token revocation");
        Ok(())
    }

    /// Describe a token to the client that owns it. Trustworthy clients may
    /// introspect any token.
    ///
    /// # Errors
    /// `server_error` on storage failure.
    pub async fn introspect(&self, token: &str, client: &Client) -> Result<Introspection, OAuthError> {
        if token.is_empty() {
            return Ok(Introspection::inactive());
        }
        let hash = secret::digest(token);
        let visible = |record: &BearerRecord| client.is_trustworthy || record.client_id == client.client_id;
        let now = Utc::now();

        if let Some(record) = self.store.find_bearer(&hash).await? {
            let expires_at = record.created_at + self.access_ttl;
            if visible(&record) && expires_at > now {
                return Ok(describe(&record, expires_at, "access_token"));
            }
            return Ok(Introspection::inactive());
        }
        if let Some((refresh, bearer)) = self.store.find_refresh(&hash).await? {
            let expires_at = refresh.created_at + self.refresh_ttl;
            if visible(&bearer) && expires_at > now {
                let mut info = describe(&bearer, expires_at, "refresh_token");
                info.iat = Some(refresh.created_at.timestamp());
                return Ok(info);
            }
        }
        Ok(Introspection::inactive())
    }
}

fn describe(record: &BearerRecord, expires_at: DateTime<Utc>, token_type: &str) -> Introspection {
    Introspection {
        active: true,
        scope: Some(record.scopes.to_string()),
        client_id: Some(record.client_id.clone()),
        sub: Some(record.user_id.to_string()),
        exp: Some(expires_at.timestamp()),
        iat: Some(record.created_at.timestamp()),
        token_type: Some(token_type.to_string()),
    }
}

fn invalid_refresh() -> OAuthError {
    OAuthError::InvalidGrant("invalid refresh token".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth2::client::ClientType;
    use crate::store::memory::MemoryStore;
    use anyhow::{Result, bail};

    fn client(id: &str) -> Client {
        Client::new(id, id, ClientType::Web).with_secret("secret")
    }

    fn mint_request(client_id: &str) -> Result<MintRequest> {
        Ok(MintRequest {
            client_id: client_id.to_string(),
            user_id: Uuid::new_v4(),
            scopes: ScopeSet::parse("openid email")?,
            device_id: None,
            family_id: None,
            auth_time: Utc::now(),
        })
    }

    fn engine(store: &Arc<MemoryStore>) -> TokenEngine {
        TokenEngine::new(store.clone(), 3600, 86_400)
    }

    #[tokio::test]
    async fn mint_pair_validates() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let issued = engine.mint_pair(mint_request("web")?).await?;
        assert!(issued.refresh_token.is_some());
        assert_ne!(Some(&issued.access_token), issued.refresh_token.as_ref());
        match engine.validate_bearer(&issued.access_token).await? {
            BearerStatus::Active(record) => assert_eq!(record.client_id, "web"),
            other => bail!("unexpected status {other:?}"),
        }
        assert_eq!(engine.validate_bearer("nope").await?, BearerStatus::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn bearer_expires_by_age() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = TokenEngine::new(store.clone(), 0, 86_400);
        let issued = engine.mint_bearer(mint_request("svc")?).await?;
        assert!(issued.refresh_token.is_none());
        assert_eq!(
            engine.validate_bearer(&issued.access_token).await?,
            BearerStatus::Expired
        );
        Ok(())
    }

    #[tokio::test]
    async fn rotation_invalidates_previous_pair() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let web = client("web");
        let first = engine.mint_pair(mint_request("web")?).await?;
        let Some(refresh) = first.refresh_token.clone() else {
            bail!("missing refresh token");
        };

        let second = engine.rotate(&refresh, &web).await?;
        assert_eq!(second.grant.family_id, first.grant.family_id);
        assert_eq!(second.grant.user_id, first.grant.user_id);
        assert_eq!(second.grant.auth_time, first.grant.auth_time);
        assert_eq!(
            engine.validate_bearer(&first.access_token).await?,
            BearerStatus::NotFound
        );

        let replay = engine.rotate(&refresh, &web).await;
        assert!(matches!(replay, Err(OAuthError::InvalidGrant(_))));
        Ok(())
    }

    #[tokio::test]
    async fn replay_revokes_family() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let web = client("web");
        let first = engine.mint_pair(mint_request("web")?).await?;
        let Some(refresh) = first.refresh_token else {
            bail!("missing refresh token");
        };
        let second = engine.rotate(&refresh, &web).await?;
        assert!(engine.rotate(&refresh, &web).await.is_err());
        assert_eq!(
            engine.validate_bearer(&second.access_token).await?,
            BearerStatus::NotFound
        );
        Ok(())
    }

    #[tokio::test]
    async fn replay_keeps_family_when_detection_off() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store).with_reuse_detection(false);
        let web = client("web");
        let first = engine.mint_pair(mint_request("web")?).await?;
        let Some(refresh) = first.refresh_token else {
            bail!("missing refresh token");
        };
        let second = engine.rotate(&refresh, &web).await?;
        assert!(engine.rotate(&refresh, &web).await.is_err());
        assert!(matches!(
            engine.validate_bearer(&second.access_token).await?,
            BearerStatus::Active(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn rotation_rejects_other_client() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let first = engine.mint_pair(mint_request("web")?).await?;
        let Some(refresh) = first.refresh_token else {
            bail!("missing refresh token");
        };
        let result = engine.rotate(&refresh, &client("intruder")).await;
        assert!(matches!(result, Err(OAuthError::InvalidGrant(_))));
        assert!(engine.rotate(&refresh, &client("web")).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn expired_refresh_token_is_rejected() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = TokenEngine::new(store.clone(), 3600, 0);
        let first = engine.mint_pair(mint_request("web")?).await?;
        let Some(refresh) = first.refresh_token else {
            bail!("missing refresh token");
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let result = engine.rotate(&refresh, &client("web")).await;
        assert!(matches!(result, Err(OAuthError::InvalidGrant(_))));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_cascades_and_ignores_foreign_tokens() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let web = client("web");
        let issued = engine.mint_pair(mint_request("web")?).await?;
        let Some(refresh) = issued.refresh_token.clone() else {
            bail!("missing refresh token");
        };

        engine.revoke(&issued.access_token, &client("other")).await?;
        assert!(matches!(
            engine.validate_bearer(&issued.access_token).await?,
            BearerStatus::Active(_)
        ));

        engine.revoke(&issued.access_token, &web).await?;
        assert_eq!(
            engine.validate_bearer(&issued.access_token).await?,
            BearerStatus::NotFound
        );
        assert!(engine.rotate(&refresh, &web).await.is_err());

        engine.revoke(&issued.access_token, &web).await?;
        Ok(())
    }

    #[tokio::test]
    async fn revoking_refresh_takes_bearer() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let web = client("web");
        let issued = engine.mint_pair(mint_request("web")?).await?;
        let Some(refresh) = issued.refresh_token.clone() else {
            bail!("missing refresh token");
        };
        engine.revoke(&refresh, &web).await?;
        assert_eq!(
            engine.validate_bearer(&issued.access_token).await?,
            BearerStatus::NotFound
        );
        Ok(())
    }

    #[tokio::test]
    async fn introspection_visibility() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let issued = engine.mint_pair(mint_request("web")?).await?;

        let own = engine.introspect(&issued.access_token, &client("web")).await?;
        assert!(own.active);
        assert_eq!(own.token_type.as_deref(), Some("access_token"));
        assert_eq!(own.scope.as_deref(), Some("email openid"));

        let foreign = engine.introspect(&issued.access_token, &client("other")).await?;
        assert_eq!(foreign, Introspection::inactive());

        let trusted = client("rs").with_trustworthy(true);
        assert!(engine.introspect(&issued.access_token, &trusted).await?.active);

        if let Some(refresh) = issued.refresh_token {
            let info = engine.introspect(&refresh, &client("web")).await?;
            assert_eq!(info.token_type.as_deref(), Some("refresh_token"));
        }
        Ok(())
    }
}
