//! In-process store. Every atomic section holds one mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ClientStore, CodeStore, DeviceStore, PruneCutoffs, PruneReport, Store, StoreError, TokenStore,
};
use crate::mfa::device::{CounterUpdate, Device, DeviceKind, Profile};
use crate::oauth2::client::Client;
use crate::oauth2::code::AuthorizationCode;
use crate::oauth2::token::{BearerRecord, RefreshRecord, RotateOutcome, RotateRequest};

struct Tombstone {
    family_id: Uuid,
    rotated_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    clients: HashMap<String, Client>,
    codes: HashMap<Vec<u8>, AuthorizationCode>,
    bearers: HashMap<Vec<u8>, BearerRecord>,
    refresh_tokens: HashMap<Vec<u8>, RefreshRecord>,
    tombstones: HashMap<Vec<u8>, Tombstone>,
    devices: HashMap<Uuid, Device>,
    profiles: HashMap<Uuid, Profile>,
}

impl State {
    fn token_hash_taken(&self, hash: &[u8]) -> bool {
        self.bearers.contains_key(hash) || self.refresh_tokens.contains_key(hash)
    }

    fn remove_pair(&mut self, bearer_hash: &[u8]) {
        self.bearers.remove(bearer_hash);
        self.refresh_tokens
            .retain(|_, refresh| refresh.bearer_hash != bearer_hash);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a client. Clients are managed outside the core,
    /// so this lives here rather than on [`ClientStore`].
    pub async fn insert_client(&self, client: Client) {
        let mut state = self.state.lock().await;
        state.clients.insert(client.client_id.clone(), client);
    }
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn find_client(&self, client_id: &str) -> Result<Option<Client>, StoreError> {
        Ok(self.state.lock().await.clients.get(client_id).cloned())
    }
}

#[async_trait]
impl CodeStore for MemoryStore {
    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.codes.contains_key(&code.code_hash) {
            return Err(StoreError::Conflict);
        }
        state.codes.insert(code.code_hash.clone(), code.clone());
        Ok(())
    }

    async fn take_code(&self, code_hash: &[u8]) -> Result<Option<AuthorizationCode>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.codes.get_mut(code_hash).map(|code| {
            let before = code.clone();
            code.is_valid = false;
            before
        }))
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_tokens(
        &self,
        bearer: &BearerRecord,
        refresh: Option<&RefreshRecord>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.token_hash_taken(&bearer.token_hash)
            || refresh.is_some_and(|refresh| state.token_hash_taken(&refresh.token_hash))
        {
            return Err(StoreError::Conflict);
        }
        state
            .bearers
            .insert(bearer.token_hash.clone(), bearer.clone());
        if let Some(refresh) = refresh {
            state
                .refresh_tokens
                .insert(refresh.token_hash.clone(), refresh.clone());
        }
        Ok(())
    }

    async fn find_bearer(&self, token_hash: &[u8]) -> Result<Option<BearerRecord>, StoreError> {
        Ok(self.state.lock().await.bearers.get(token_hash).cloned())
    }

    async fn find_refresh(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<(RefreshRecord, BearerRecord)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.refresh_tokens.get(token_hash).and_then(|refresh| {
            state
                .bearers
                .get(&refresh.bearer_hash)
                .map(|bearer| (refresh.clone(), bearer.clone()))
        }))
    }

    async fn rotate_refresh(&self, request: &RotateRequest) -> Result<RotateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state
            .tombstones
            .retain(|_, tombstone| tombstone.rotated_at >= request.not_before);

        let Some(refresh) = state.refresh_tokens.get(&request.refresh_hash).cloned() else {
            return Ok(match state.tombstones.get(&request.refresh_hash) {
                Some(tombstone) => RotateOutcome::Reused {
                    family_id: tombstone.family_id,
                },
                None => RotateOutcome::NotFound,
            });
        };
        let Some(bearer) = state.bearers.get(&refresh.bearer_hash).cloned() else {
            state.refresh_tokens.remove(&request.refresh_hash);
            return Ok(RotateOutcome::NotFound);
        };
        if bearer.client_id != request.client_id {
            return Ok(RotateOutcome::ClientMismatch);
        }
        if refresh.created_at < request.not_before {
            state.remove_pair(&bearer.token_hash);
            return Ok(RotateOutcome::Expired);
        }
        if state.token_hash_taken(&request.new_bearer_hash)
            || state.token_hash_taken(&request.new_refresh_hash)
        {
            return Err(StoreError::Conflict);
        }

        state.remove_pair(&bearer.token_hash);
        state.tombstones.insert(
            request.refresh_hash.clone(),
            Tombstone {
                family_id: bearer.family_id,
                rotated_at: request.now,
            },
        );
        let rotated = BearerRecord {
            token_hash: request.new_bearer_hash.clone(),
            created_at: request.now,
            ..bearer
        };
        state
            .bearers
            .insert(rotated.token_hash.clone(), rotated.clone());
        state.refresh_tokens.insert(
            request.new_refresh_hash.clone(),
            RefreshRecord {
                token_hash: request.new_refresh_hash.clone(),
                bearer_hash: rotated.token_hash.clone(),
                created_at: request.now,
            },
        );
        Ok(RotateOutcome::Rotated(rotated))
    }

    async fn revoke(&self, token_hash: &[u8], client_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let bearer_hash = if let Some(bearer) = state.bearers.get(token_hash) {
            (bearer.client_id == client_id).then(|| bearer.token_hash.clone())
        } else if let Some(refresh) = state.refresh_tokens.get(token_hash) {
            state
                .bearers
                .get(&refresh.bearer_hash)
                .filter(|bearer| bearer.client_id == client_id)
                .map(|bearer| bearer.token_hash.clone())
        } else {
            None
        };
        match bearer_hash {
            Some(bearer_hash) => {
                state.remove_pair(&bearer_hash);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_family(&self, family_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<Vec<u8>> = state
            .bearers
            .values()
            .filter(|bearer| bearer.family_id == family_id)
            .map(|bearer| bearer.token_hash.clone())
            .collect();
        for bearer_hash in &doomed {
            state.remove_pair(bearer_hash);
        }
        Ok(u64::try_from(doomed.len()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .devices
            .values()
            .filter(|device| device.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_device(&self, user_id: Uuid, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .devices
            .get(&device_id)
            .filter(|device| device.user_id == user_id)
            .cloned())
    }

    async fn insert_device(&self, device: &Device) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.devices.contains_key(&device.id) {
            return Err(StoreError::Conflict);
        }
        state.devices.insert(device.id, device.clone());
        Ok(())
    }

    async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let owned = state
            .devices
            .get(&device_id)
            .is_some_and(|device| device.user_id == user_id);
        if owned {
            state.devices.remove(&device_id);
        }
        Ok(owned)
    }

    async fn record_device_use(&self, update: &CounterUpdate) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(device) = state
            .devices
            .get_mut(&update.device_id)
            .filter(|device| device.user_id == update.user_id)
        else {
            return Ok(false);
        };
        if device.last_t() != update.expected_last_t {
            return Ok(false);
        }
        match &mut device.kind {
            DeviceKind::Totp(params) => {
                if let Some(last_t) = update.last_t {
                    params.last_t = last_t;
                }
                if let Some(drift) = update.drift {
                    params.drift = drift;
                }
            }
            DeviceKind::OutOfBand(params) => {
                if let Some(last_t) = update.last_t {
                    params.last_t = last_t;
                }
            }
            DeviceKind::HardwareKey(_) => {}
        }
        device.last_used = Some(update.last_used);
        if update.confirm {
            device.confirmed = true;
        }
        Ok(true)
    }

    async fn find_profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        Ok(self.state.lock().await.profiles.get(&user_id).cloned())
    }

    async fn save_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.profiles.insert(profile.user_id, profile.clone());
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn prune_expired(&self, cutoffs: &PruneCutoffs) -> Result<PruneReport, StoreError> {
        let mut state = self.state.lock().await;
        let mut report = PruneReport::default();

        let before = state.codes.len();
        state
            .codes
            .retain(|_, code| code.created_at >= cutoffs.codes_before);
        report.codes = count(before, state.codes.len());

        let before = state.refresh_tokens.len();
        state
            .refresh_tokens
            .retain(|_, refresh| refresh.created_at >= cutoffs.refresh_before);
        report.refresh_tokens = count(before, state.refresh_tokens.len());

        let State {
            bearers,
            refresh_tokens,
            ..
        } = &mut *state;
        let before = bearers.len();
        bearers.retain(|hash, bearer| {
            bearer.created_at >= cutoffs.bearers_before
                || refresh_tokens
                    .values()
                    .any(|refresh| &refresh.bearer_hash == hash)
        });
        report.bearers = count(before, bearers.len());

        state
            .tombstones
            .retain(|_, tombstone| tombstone.rotated_at >= cutoffs.refresh_before);
        Ok(report)
    }
}

fn count(before: usize, after: usize) -> u64 {
    u64::try_from(before.saturating_sub(after)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth2::scope::ScopeSet;
    use anyhow::Result;
    use std::sync::Arc;

    fn bearer(hash: u8, family_id: Uuid) -> BearerRecord {
        BearerRecord {
            token_hash: vec![hash; 32],
            client_id: "web".to_string(),
            user_id: Uuid::new_v4(),
            scopes: ScopeSet::from_stored("openid"),
            device_id: None,
            family_id,
            auth_time: Utc::now(),
            created_at: Utc::now(),
        }
    }

    fn refresh(hash: u8, bearer_hash: u8) -> RefreshRecord {
        RefreshRecord {
            token_hash: vec![hash; 32],
            bearer_hash: vec![bearer_hash; 32],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_tokens_detects_collisions() -> Result<()> {
        let store = MemoryStore::new();
        let family = Uuid::new_v4();
        store.insert_tokens(&bearer(1, family), Some(&refresh(2, 1))).await?;
        assert!(matches!(
            store.insert_tokens(&bearer(1, family), None).await,
            Err(StoreError::Conflict)
        ));
        assert!(matches!(
            store.insert_tokens(&bearer(3, family), Some(&refresh(2, 3))).await,
            Err(StoreError::Conflict)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_code_takes_see_one_valid() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let code = AuthorizationCode {
            id: Uuid::new_v4(),
            code_hash: vec![9; 32],
            client_id: "web".to_string(),
            user_id: Uuid::new_v4(),
            redirect_uri: "https://app.example.com/cb".to_string(),
            scopes: ScopeSet::from_stored("openid"),
            pkce: None,
            nonce: None,
            device_id: None,
            auth_time: Utc::now(),
            is_valid: true,
            created_at: Utc::now(),
        };
        store.insert_code(&code).await?;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.take_code(&[9; 32]).await }));
        }
        let mut valid = 0;
        for handle in handles {
            if let Some(code) = handle.await?? {
                if code.is_valid {
                    valid += 1;
                }
            }
        }
        assert_eq!(valid, 1);
        Ok(())
    }

    fn code(hash: u8, created_at: DateTime<Utc>) -> AuthorizationCode {
        AuthorizationCode {
            id: Uuid::new_v4(),
            code_hash: vec![hash; 32],
            client_id: "web".to_string(),
            user_id: Uuid::new_v4(),
            redirect_uri: "https://app.example.com/cb".to_string(),
            scopes: ScopeSet::from_stored("openid"),
            pkce: None,
            nonce: None,
            device_id: None,
            auth_time: created_at,
            is_valid: true,
            created_at,
        }
    }

    #[tokio::test]
    async fn prune_drops_expired_rows_and_keeps_live_ones() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let hour_ago = now - chrono::Duration::hours(1);
        let aged = |record: BearerRecord| BearerRecord {
            created_at: hour_ago,
            ..record
        };
        let aged_refresh = |record: RefreshRecord| RefreshRecord {
            created_at: hour_ago,
            ..record
        };

        store.insert_code(&code(1, hour_ago)).await?;
        store.insert_code(&code(2, now)).await?;
        // Expired bearer, no refresh.
        store.insert_tokens(&aged(bearer(10, Uuid::new_v4())), None).await?;
        // Expired bearer kept alive by a live refresh token.
        store
            .insert_tokens(&aged(bearer(11, Uuid::new_v4())), Some(&refresh(21, 11)))
            .await?;
        // Both halves expired.
        store
            .insert_tokens(
                &aged(bearer(12, Uuid::new_v4())),
                Some(&aged_refresh(refresh(22, 12))),
            )
            .await?;
        store.insert_tokens(&bearer(13, Uuid::new_v4()), None).await?;

        let cutoffs = PruneCutoffs {
            codes_before: now - chrono::Duration::minutes(10),
            bearers_before: now - chrono::Duration::minutes(10),
            refresh_before: now - chrono::Duration::minutes(30),
        };
        let report = store.prune_expired(&cutoffs).await?;
        assert_eq!(
            report,
            PruneReport {
                codes: 1,
                bearers: 2,
                refresh_tokens: 1,
            }
        );

        assert!(store.take_code(&[1; 32]).await?.is_none());
        assert!(store.take_code(&[2; 32]).await?.is_some());
        assert!(store.find_bearer(&[10; 32]).await?.is_none());
        assert!(store.find_refresh(&[21; 32]).await?.is_some());
        assert!(store.find_refresh(&[22; 32]).await?.is_none());
        assert!(store.find_bearer(&[12; 32]).await?.is_none());
        assert!(store.find_bearer(&[13; 32]).await?.is_some());

        assert_eq!(store.prune_expired(&cutoffs).await?.total(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn revoke_family_removes_all_pairs() -> Result<()> {
        let store = MemoryStore::new();
        let family = Uuid::new_v4();
        store.insert_tokens(&bearer(1, family), Some(&refresh(2, 1))).await?;
        store.insert_tokens(&bearer(3, family), Some(&refresh(4, 3))).await?;
        store.insert_tokens(&bearer(5, Uuid::new_v4()), None).await?;
        assert_eq!(store.revoke_family(family).await?, 2);
        assert!(store.find_refresh(&[2; 32]).await?.is_none());
        assert!(store.find_bearer(&[5; 32]).await?.is_some());
        Ok(())
    }
}
