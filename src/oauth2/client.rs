//! Client registry: registered relying parties and their permissions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, warn};
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{error::OAuthError, scope::ScopeSet};
use crate::store::ClientStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    Web,
    SinglePage,
    Native,
    Service,
    Trusted,
}

impl ClientType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::SinglePage => "single-page",
            Self::Native => "native",
            Self::Service => "service",
            Self::Trusted => "trusted",
        }
    }

    /// Confidential clients can keep a secret.
    #[must_use]
    pub const fn is_confidential(self) -> bool {
        matches!(self, Self::Web | Self::Service | Self::Trusted)
    }

    #[must_use]
    pub const fn allows_grant(self, grant: GrantType) -> bool {
        match self {
            Self::Web | Self::Native | Self::SinglePage => matches!(
                grant,
                GrantType::AuthorizationCode | GrantType::RefreshToken
            ),
            Self::Service => matches!(grant, GrantType::ClientCredentials),
            Self::Trusted => matches!(
                grant,
                GrantType::AuthorizationCode | GrantType::RefreshToken | GrantType::Password
            ),
        }
    }
}

impl FromStr for ClientType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "web" => Ok(Self::Web),
            "single-page" | "javascript" => Ok(Self::SinglePage),
            "native" => Ok(Self::Native),
            "service" => Ok(Self::Service),
            "trusted" => Ok(Self::Trusted),
            other => Err(format!("unknown client type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    ClientCredentials,
    Password,
}

impl GrantType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
            Self::ClientCredentials => "client_credentials",
            Self::Password => "password",
        }
    }
}

impl FromStr for GrantType {
    type Err = OAuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "authorization_code" => Ok(Self::AuthorizationCode),
            "refresh_token" => Ok(Self::RefreshToken),
            "client_credentials" => Ok(Self::ClientCredentials),
            "password" => Ok(Self::Password),
            "" => Err(OAuthError::InvalidRequest(
                "missing grant_type".to_string(),
            )),
            other => Err(OAuthError::UnsupportedGrantType(format!(
                "grant_type {other} is not supported"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientValidationError {
    #[error("service client requires an associated service user")]
    MissingServiceUser,
    #[error("only service clients may have an associated user")]
    UnexpectedServiceUser,
    #[error("public client must not hold a secret")]
    UnexpectedSecret,
    #[error("confidential client requires a secret")]
    MissingSecret,
}

/// A registered relying party. Read-only to the core.
#[derive(Clone)]
pub struct Client {
    pub client_id: String,
    pub name: String,
    /// SHA-256 of the client secret.
    pub secret_hash: Option<Vec<u8>>,
    pub client_type: ClientType,
    pub redirect_uris: BTreeSet<String>,
    pub post_logout_redirect_uris: BTreeSet<String>,
    pub scopes: ScopeSet,
    pub is_active: bool,
    pub is_trustworthy: bool,
    pub pkce_required: bool,
    pub service_user: Option<Uuid>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id)
            .field("name", &self.name)
            .field("secret_hash", &self.secret_hash.as_ref().map(|_| "***"))
            .field("client_type", &self.client_type)
            .field("redirect_uris", &self.redirect_uris)
            .field("scopes", &self.scopes)
            .field("is_active", &self.is_active)
            .field("is_trustworthy", &self.is_trustworthy)
            .field("pkce_required", &self.pkce_required)
            .field("service_user", &self.service_user)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start a client with the default scopes and no redirect URIs.
    #[must_use]
    pub fn new(client_id: impl Into<String>, name: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            client_id: client_id.into(),
            name: name.into(),
            secret_hash: None,
            client_type,
            redirect_uris: BTreeSet::new(),
            post_logout_redirect_uris: BTreeSet::new(),
            scopes: ScopeSet::from_stored(super::scope::DEFAULT_CLIENT_SCOPES),
            is_active: true,
            is_trustworthy: false,
            pkce_required: false,
            service_user: None,
        }
    }

    #[must_use]
    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secret_hash = Some(hash_client_secret(secret));
        self
    }

    #[must_use]
    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uris.insert(uri.into());
        self
    }

    #[must_use]
    pub fn with_post_logout_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.post_logout_redirect_uris.insert(uri.into());
        self
    }

    #[must_use]
    pub fn with_scopes(mut self, scopes: ScopeSet) -> Self {
        self.scopes = scopes;
        self
    }

    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    #[must_use]
    pub fn with_trustworthy(mut self, trustworthy: bool) -> Self {
        self.is_trustworthy = trustworthy;
        self
    }

    #[must_use]
    pub fn with_pkce_required(mut self, required: bool) -> Self {
        self.pkce_required = required;
        self
    }

    #[must_use]
    pub fn with_service_user(mut self, user_id: Uuid) -> Self {
        self.service_user = Some(user_id);
        self
    }

    #[must_use]
    pub fn is_confidential(&self) -> bool {
        self.client_type.is_confidential()
    }

    /// Check the structural invariants of a client record.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ClientValidationError> {
        if self.client_type == ClientType::Service && self.service_user.is_none() {
            return Err(ClientValidationError::MissingServiceUser);
        }
        if self.client_type != ClientType::Service && self.service_user.is_some() {
            return Err(ClientValidationError::UnexpectedServiceUser);
        }
        if self.is_confidential() && self.secret_hash.is_none() {
            return Err(ClientValidationError::MissingSecret);
        }
        if !self.is_confidential() && self.secret_hash.is_some() {
            return Err(ClientValidationError::UnexpectedSecret);
        }
        Ok(())
    }

    /// Exact match against the registered redirect URIs.
    #[must_use]
    pub fn validate_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.contains(uri)
    }

    #[must_use]
    pub fn validate_post_logout_redirect(&self, uri: &str) -> bool {
        self.post_logout_redirect_uris.contains(uri)
    }

    /// Constant-time comparison of a presented secret against the stored digest.
    #[must_use]
    pub fn verify_secret(&self, presented: &str) -> bool {
        self.secret_hash.as_ref().is_some_and(|stored| {
            let presented = hash_client_secret(presented);
            stored.as_slice().ct_eq(presented.as_slice()).into()
        })
    }

    /// Trustworthy clients may read token responses from the origins of their
    /// registered redirect URIs.
    #[must_use]
    pub fn allowed_origin(&self, origin: &str) -> bool {
        if !self.is_trustworthy {
            return false;
        }
        self.redirect_uris
            .iter()
            .filter_map(|uri| Url::parse(uri).ok())
            .any(|uri| uri.origin().ascii_serialization() == origin)
    }
}

#[must_use]
pub fn hash_client_secret(secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

/// Credentials presented at the token, revocation and introspection endpoints.
#[derive(Clone, Default)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Clone)]
pub struct ClientRegistry {
    store: Arc<dyn ClientStore>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn ClientStore>) -> Self {
        Self { store }
    }

    /// Resolve an active, well-formed client.
    ///
    /// # Errors
    /// `invalid_client` when the client is unknown, inactive or misconfigured.
    pub async fn resolve(&self, client_id: &str) -> Result<Client, OAuthError> {
        if client_id.is_empty() {
            return Err(OAuthError::InvalidClient("missing client_id".to_string()));
        }
        let Some(client) = self.store.find_client(client_id).await? else {
            warn!(client_id, "unknown client");
            return Err(OAuthError::InvalidClient("unknown client".to_string()));
        };
        if !client.is_active {
            warn!(client_id, "inactive client");
            return Err(OAuthError::InvalidClient("unknown client".to_string()));
        }
        if let Err(err) = client.validate() {
            error!(client_id, "client record is invalid: {err}");
            return Err(OAuthError::InvalidClient("unknown client".to_string()));
        }
        Ok(client)
    }

    #[must_use]
    pub fn validate_redirect(client: &Client, uri: &str) -> bool {
        client.validate_redirect(uri)
    }

    #[must_use]
    pub fn is_confidential(client: &Client) -> bool {
        client.is_confidential()
    }

    /// Authenticate the caller of a back-channel endpoint.
    ///
    /// Confidential clients must present their secret; public clients
    /// identify with `client_id` only and must not send a secret.
    ///
    /// # Errors
    /// `invalid_client` on any mismatch.
    pub async fn authenticate(&self, credentials: &ClientCredentials) -> Result<Client, OAuthError> {
        let client = self.resolve(&credentials.client_id).await?;
        match (&credentials.client_secret, client.is_confidential()) {
            (Some(secret), true) if client.verify_secret(secret) => Ok(client),
            (None, false) => Ok(client),
            _ => {
                warn!(client_id = %client.client_id, "client authentication failed");
                Err(OAuthError::InvalidClient(
                    "client authentication failed".to_string(),
                ))
            }
        }
    }

    /// # Errors
    /// `unauthorized_client` when the client type may not use the grant.
    pub fn ensure_grant(client: &Client, grant: GrantType) -> Result<(), OAuthError> {
        if client.client_type.allows_grant(grant) {
            Ok(())
        } else {
            warn!(
                client_id = %client.client_id,
                client_type = client.client_type.as_str(),
                grant_type = grant.as_str(),
                "client_type and grant_type combination is invalid"
            );
            Err(OAuthError::UnauthorizedClient(format!(
                "client may not use the {} grant",
                grant.as_str()
            )))
        }
    }
}
