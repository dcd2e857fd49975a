//! Persistence seams.
//!
//! The engines only see these traits. Atomic sections (code redemption,
//! refresh rotation, device counter updates) are single trait calls so each
//! backend can implement them as one transaction or one locked section.

pub mod memory;
pub mod postgres;
pub mod prune;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::mfa::device::{CounterUpdate, Device, Profile};
use crate::oauth2::client::Client;
use crate::oauth2::code::AuthorizationCode;
use crate::oauth2::token::{BearerRecord, RefreshRecord, RotateOutcome, RotateRequest};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique key already exists; callers may retry with fresh values.
    #[error("unique constraint violated")]
    Conflict,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            Self::Conflict
        } else {
            Self::Backend(err.into())
        }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Rows created before these instants can no longer be redeemed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PruneCutoffs {
    pub codes_before: DateTime<Utc>,
    pub bearers_before: DateTime<Utc>,
    pub refresh_before: DateTime<Utc>,
}

/// Rows removed by one prune pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub codes: u64,
    pub bearers: u64,
    pub refresh_tokens: u64,
}

impl PruneReport {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.codes + self.bearers + self.refresh_tokens
    }
}

#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn find_client(&self, client_id: &str) -> Result<Option<Client>, StoreError>;
}

#[async_trait]
pub trait CodeStore: Send + Sync {
    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), StoreError>;

    /// Load a code and mark it invalid in one atomic step. The returned
    /// record carries `is_valid` as it was before the call.
    async fn take_code(&self, code_hash: &[u8]) -> Result<Option<AuthorizationCode>, StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_tokens(
        &self,
        bearer: &BearerRecord,
        refresh: Option<&RefreshRecord>,
    ) -> Result<(), StoreError>;

    async fn find_bearer(&self, token_hash: &[u8]) -> Result<Option<BearerRecord>, StoreError>;

    /// A refresh token and the bearer it belongs to.
    async fn find_refresh(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<(RefreshRecord, BearerRecord)>, StoreError>;

    /// Swap a refresh token for a new pair atomically and leave a tombstone
    /// behind.
    async fn rotate_refresh(&self, request: &RotateRequest) -> Result<RotateOutcome, StoreError>;

    /// Delete the bearer or refresh token with this digest if `client_id`
    /// owns it, cascading to the other half of the pair.
    async fn revoke(&self, token_hash: &[u8], client_id: &str) -> Result<bool, StoreError>;

    /// Delete every live token of a family. Returns how many bearers went.
    async fn revoke_family(&self, family_id: Uuid) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError>;

    async fn find_device(&self, user_id: Uuid, device_id: Uuid) -> Result<Option<Device>, StoreError>;

    async fn insert_device(&self, device: &Device) -> Result<(), StoreError>;

    async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool, StoreError>;

    /// Apply a counter update only if the stored `last_t` still equals
    /// `expected_last_t`. Returns whether it was applied.
    async fn record_device_use(&self, update: &CounterUpdate) -> Result<bool, StoreError>;

    async fn find_profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError>;

    async fn save_profile(&self, profile: &Profile) -> Result<(), StoreError>;
}

/// Everything the service needs from one backend.
#[async_trait]
pub trait Store: ClientStore + CodeStore + TokenStore + DeviceStore {
    /// Cheap liveness probe for `/health`.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Delete expired codes, refresh tokens and bearers. A bearer stays while
    /// a live refresh token still points at it. Rotation tombstones older
    /// than `refresh_before` go too.
    async fn prune_expired(&self, cutoffs: &PruneCutoffs) -> Result<PruneReport, StoreError>;
}
