//! Device registry: enrollment, confirmation, defaults and removal.
//!
//! Every mutation names the acting user explicitly; a device is only ever
//! visible to the user that owns it.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::challenge::ChallengeEngine;
use super::device::{
    Device, DeviceKind, HARDWARE_KEY_VERSION, HardwareKeyParams, INITIAL_LAST_T, OutOfBandParams,
    Profile, TotpParams,
};
use super::{out_of_band, totp};
use crate::secret;
use crate::store::{DeviceStore, StoreError};

/// Shared secrets are 20 random bytes (160 bits, RFC 4226).
const KEY_BYTES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device not found")]
    NotFound,
    #[error("device already confirmed")]
    AlreadyConfirmed,
    #[error("device is not confirmed")]
    NotConfirmed,
    #[error("invalid verification code")]
    InvalidCode,
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A freshly registered TOTP device and the URI to load it into an app.
#[derive(Debug, Clone)]
pub struct TotpEnrollment {
    pub device: Device,
    pub provisioning_uri: String,
}

#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
    challenges: ChallengeEngine,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("challenges", &self.challenges)
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn DeviceStore>, challenges: ChallengeEngine) -> Self {
        Self { store, challenges }
    }

    #[must_use]
    pub fn challenges(&self) -> &ChallengeEngine {
        &self.challenges
    }

    async fn next_order(&self, actor: Uuid) -> Result<i32, DeviceError> {
        let devices = self.store.list_devices(actor).await?;
        Ok(devices.iter().map(|device| device.order).max().map_or(0, |max| max + 1))
    }

    async fn insert(&self, actor: Uuid, name: &str, kind: DeviceKind) -> Result<Device, DeviceError> {
        let name = name.trim();
        if name.is_empty() || name.len() > 64 {
            return Err(DeviceError::InvalidInput(
                "device name must be 1 to 64 characters".to_string(),
            ));
        }
        let mut device = Device::new(actor, name, kind);
        device.order = self.next_order(actor).await?;
        self.store.insert_device(&device).await?;
        info!(user_id = %actor, device_id = %device.id, device_type = device.device_type().as_str(), "device registered");
        Ok(device)
    }

    /// # Errors
    /// `InvalidInput` for a bad name or digit count.
    pub async fn register_totp(
        &self,
        actor: Uuid,
        name: &str,
        digits: u32,
        account: &str,
    ) -> Result<TotpEnrollment, DeviceError> {
        if digits != 6 && digits != 8 {
            return Err(DeviceError::InvalidInput("digits must be 6 or 8".to_string()));
        }
        let key = hex::encode(secret::random_bytes(KEY_BYTES)?);
        let params = TotpParams::new(key, digits);
        let provisioning_uri =
            totp::provisioning_uri(&params, self.challenges.issuer_name(), account)?;
        let device = self.insert(actor, name, DeviceKind::Totp(params)).await?;
        Ok(TotpEnrollment {
            device,
            provisioning_uri,
        })
    }

    /// # Errors
    /// `InvalidInput` unless `target` is an E.164 phone number.
    pub async fn register_out_of_band(&self, actor: Uuid, name: &str, target: &str) -> Result<Device, DeviceError> {
        let target = target.trim();
        if !out_of_band::valid_target(target) {
            return Err(DeviceError::InvalidInput(
                "target must be an E.164 phone number".to_string(),
            ));
        }
        let params = OutOfBandParams {
            target: target.to_string(),
            key: hex::encode(secret::random_bytes(KEY_BYTES)?),
            last_t: INITIAL_LAST_T,
        };
        self.insert(actor, name, DeviceKind::OutOfBand(params)).await
    }

    /// # Errors
    /// `InvalidInput` for a malformed public key.
    pub async fn register_hardware_key(
        &self,
        actor: Uuid,
        name: &str,
        public_key: Vec<u8>,
        key_handle: &str,
        app_id: &str,
    ) -> Result<Device, DeviceError> {
        if public_key.len() != 32 {
            return Err(DeviceError::InvalidInput(
                "public key must be 32 bytes".to_string(),
            ));
        }
        if key_handle.is_empty() || app_id.is_empty() {
            return Err(DeviceError::InvalidInput(
                "key handle and app id are required".to_string(),
            ));
        }
        let params = HardwareKeyParams {
            public_key,
            key_handle: key_handle.to_string(),
            app_id: app_id.to_string(),
            version: HARDWARE_KEY_VERSION.to_string(),
        };
        self.insert(actor, name, DeviceKind::HardwareKey(params)).await
    }

    /// # Errors
    /// `NotFound` unless the device belongs to `actor`.
    pub async fn get(&self, actor: Uuid, device_id: Uuid) -> Result<Device, DeviceError> {
        self.store
            .find_device(actor, device_id)
            .await?
            .ok_or(DeviceError::NotFound)
    }

    /// # Errors
    /// Storage failures only.
    pub async fn list(&self, actor: Uuid) -> Result<Vec<Device>, DeviceError> {
        let mut devices = self.store.list_devices(actor).await?;
        devices.sort_by_key(|device| (device.order, device.created_at));
        Ok(devices)
    }

    /// Confirmed devices, default first.
    ///
    /// # Errors
    /// Storage failures only.
    pub async fn confirmed(&self, actor: Uuid) -> Result<Vec<Device>, DeviceError> {
        let profile = self.profile(actor).await?;
        let mut devices: Vec<Device> = self
            .list(actor)
            .await?
            .into_iter()
            .filter(|device| device.confirmed)
            .collect();
        devices.sort_by_key(|device| Some(device.id) != profile.default_device);
        Ok(devices)
    }

    /// # Errors
    /// Storage failures only.
    pub async fn profile(&self, actor: Uuid) -> Result<Profile, DeviceError> {
        Ok(self
            .store
            .find_profile(actor)
            .await?
            .unwrap_or_else(|| Profile::new(actor)))
    }

    /// The default device, if it is still confirmed.
    ///
    /// # Errors
    /// Storage failures only.
    pub async fn default_device(&self, actor: Uuid) -> Result<Option<Device>, DeviceError> {
        let profile = self.profile(actor).await?;
        let Some(device_id) = profile.default_device else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_device(actor, device_id)
            .await?
            .filter(|device| device.confirmed))
    }

    /// Confirm a pending device with its first valid response. The first
    /// confirmed device becomes the default.
    ///
    /// # Errors
    /// `NotFound`, `AlreadyConfirmed` or `InvalidCode`.
    pub async fn confirm(&self, actor: Uuid, device_id: Uuid, response: &str) -> Result<Device, DeviceError> {
        let device = self.get(actor, device_id).await?;
        if device.confirmed {
            return Err(DeviceError::AlreadyConfirmed);
        }
        if !self.challenges.verify_token(&device, response).await? {
            return Err(DeviceError::InvalidCode);
        }
        let mut profile = self.profile(actor).await?;
        if self.default_device(actor).await?.is_none() {
            profile.default_device = Some(device_id);
            self.store.save_profile(&profile).await?;
        }
        info!(user_id = %actor, %device_id, "device confirmed");
        self.get(actor, device_id).await
    }

    /// Remove a device. If it was the default, the next confirmed device
    /// takes its place.
    ///
    /// # Errors
    /// `NotFound` unless the device belongs to `actor`.
    pub async fn remove(&self, actor: Uuid, device_id: Uuid) -> Result<(), DeviceError> {
        if !self.store.delete_device(actor, device_id).await? {
            return Err(DeviceError::NotFound);
        }
        let mut profile = self.profile(actor).await?;
        if profile.default_device == Some(device_id) {
            profile.default_device = self
                .list(actor)
                .await?
                .into_iter()
                .find(|device| device.confirmed)
                .map(|device| device.id);
            self.store.save_profile(&profile).await?;
        }
        info!(user_id = %actor, %device_id, "device removed");
        Ok(())
    }

    /// # Errors
    /// `NotFound` or `NotConfirmed`.
    pub async fn set_default(&self, actor: Uuid, device_id: Uuid) -> Result<Profile, DeviceError> {
        let device = self.get(actor, device_id).await?;
        if !device.confirmed {
            return Err(DeviceError::NotConfirmed);
        }
        let mut profile = self.profile(actor).await?;
        profile.default_device = Some(device_id);
        self.store.save_profile(&profile).await?;
        Ok(profile)
    }

    /// # Errors
    /// Storage failures only.
    pub async fn set_mfa_enabled(&self, actor: Uuid, enabled: bool) -> Result<Profile, DeviceError> {
        let mut profile = self.profile(actor).await?;
        profile.mfa_enabled = enabled;
        self.store.save_profile(&profile).await?;
        info!(user_id = %actor, enabled, "MFA preference updated");
        Ok(profile)
    }

    /// `otpauth://` URI of a TOTP device.
    ///
    /// # Errors
    /// `InvalidInput` for other device kinds.
    pub fn provisioning_uri(&self, device: &Device, account: &str) -> Result<String, DeviceError> {
        match &device.kind {
            DeviceKind::Totp(params) => {
                Ok(totp::provisioning_uri(params, self.challenges.issuer_name(), account)?)
            }
            _ => Err(DeviceError::InvalidInput(
                "provisioning URIs exist only for TOTP devices".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mfa::hardware_key::Ed25519AssertionVerifier;
    use crate::notify::Notifier;
    use crate::store::memory::MemoryStore;
    use anyhow::{Result, bail};
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn registry() -> DeviceRegistry {
        let store = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::channel(8);
        let challenges =
            ChallengeEngine::new(store.clone(), Notifier::new(tx), Arc::new(Ed25519AssertionVerifier));
        DeviceRegistry::new(store, challenges)
    }

    fn current_code(device: &Device) -> Result<String> {
        let DeviceKind::Totp(params) = &device.kind else {
            bail!("not a totp device");
        };
        let key = totp::decode_key(&params.key)?;
        let t = totp::current_step(Utc::now().timestamp(), 0, params.step);
        totp::code_at(&key, t, params.step, params.digits)
    }

    #[tokio::test]
    async fn first_confirmed_device_becomes_default() -> Result<()> {
        let registry = registry();
        let user = Uuid::new_v4();
        let first = registry.register_totp(user, "phone", 6, "alice").await?;
        assert!(first.provisioning_uri.starts_with("otpauth://totp/"));
        let second = registry.register_totp(user, "tablet", 6, "alice").await?;
        assert_eq!(second.device.order, 1);

        assert!(matches!(
            registry.confirm(user, first.device.id, "000000x").await,
            Err(DeviceError::InvalidCode)
        ));
        let confirmed = registry
            .confirm(user, first.device.id, &current_code(&first.device)?)
            .await?;
        assert!(confirmed.confirmed);
        registry
            .confirm(user, second.device.id, &current_code(&second.device)?)
            .await?;

        let profile = registry.profile(user).await?;
        assert_eq!(profile.default_device, Some(first.device.id));
        Ok(())
    }

    #[tokio::test]
    async fn removing_default_promotes_next_confirmed() -> Result<()> {
        let registry = registry();
        let user = Uuid::new_v4();
        let first = registry.register_totp(user, "phone", 6, "alice").await?;
        let second = registry.register_totp(user, "tablet", 8, "alice").await?;
        registry.confirm(user, first.device.id, &current_code(&first.device)?).await?;
        registry.confirm(user, second.device.id, &current_code(&second.device)?).await?;

        registry.remove(user, first.device.id).await?;
        assert_eq!(registry.profile(user).await?.default_device, Some(second.device.id));

        registry.remove(user, second.device.id).await?;
        assert_eq!(registry.profile(user).await?.default_device, None);
        assert!(matches!(
            registry.remove(user, second.device.id).await,
            Err(DeviceError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn devices_are_scoped_to_actor() -> Result<()> {
        let registry = registry();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let enrollment = registry.register_totp(owner, "phone", 6, "alice").await?;
        assert!(matches!(
            registry.get(stranger, enrollment.device.id).await,
            Err(DeviceError::NotFound)
        ));
        assert!(registry.list(stranger).await?.is_empty());
        assert!(matches!(
            registry.remove(stranger, enrollment.device.id).await,
            Err(DeviceError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn set_default_requires_confirmation() -> Result<()> {
        let registry = registry();
        let user = Uuid::new_v4();
        let device = registry.register_out_of_band(user, "sms", "+15551234567").await?;
        assert!(matches!(
            registry.set_default(user, device.id).await,
            Err(DeviceError::NotConfirmed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn validation() -> Result<()> {
        let registry = registry();
        let user = Uuid::new_v4();
        assert!(registry.register_totp(user, "phone", 7, "alice").await.is_err());
        assert!(registry.register_totp(user, " ", 6, "alice").await.is_err());
        assert!(registry.register_out_of_band(user, "sms", "555").await.is_err());
        assert!(
            registry
                .register_hardware_key(user, "key", vec![0; 31], "kh", "https://sso.example.com")
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test]
    async fn mfa_preference() -> Result<()> {
        let registry = registry();
        let user = Uuid::new_v4();
        assert!(!registry.profile(user).await?.mfa_enabled);
        assert!(registry.set_mfa_enabled(user, true).await?.mfa_enabled);
        Ok(())
    }
}
