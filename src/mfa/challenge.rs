//! Challenge issuance and response verification for every device kind.

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::device::{CounterUpdate, Device, DeviceKind, LoginFormKind, mask_target};
use super::hardware_key::{self, AssertionVerifier, PendingChallenges};
use super::{out_of_band, totp};
use crate::notify::Notifier;
use crate::secret;
use crate::store::DeviceStore;

pub const DEFAULT_MAX_DRIFT_STEPS: i64 = 5;

/// What the client needs to answer a challenge.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChallengeMaterial {
    /// The user reads the code off their authenticator.
    None,
    /// A code was queued for delivery.
    Delivered { receipt: Uuid, target_hint: String },
    /// Sign `app_id || challenge || key_handle` with the key.
    Assertion {
        challenge: String,
        app_id: String,
        key_handle: String,
    },
}

#[derive(Clone)]
pub struct ChallengeEngine {
    store: Arc<dyn DeviceStore>,
    notifier: Notifier,
    pending: Arc<PendingChallenges>,
    verifier: Arc<dyn AssertionVerifier>,
    issuer_name: String,
    max_drift: i64,
}

impl std::fmt::Debug for ChallengeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeEngine")
            .field("issuer_name", &self.issuer_name)
            .field("max_drift", &self.max_drift)
            .finish_non_exhaustive()
    }
}

impl ChallengeEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn DeviceStore>,
        notifier: Notifier,
        verifier: Arc<dyn AssertionVerifier>,
    ) -> Self {
        Self {
            store,
            notifier,
            pending: Arc::new(PendingChallenges::default()),
            verifier,
            issuer_name: "SSO".to_string(),
            max_drift: DEFAULT_MAX_DRIFT_STEPS,
        }
    }

    #[must_use]
    pub fn with_issuer_name(mut self, issuer_name: impl Into<String>) -> Self {
        self.issuer_name = issuer_name.into();
        self
    }

    #[must_use]
    pub fn with_max_drift(mut self, steps: i64) -> Self {
        self.max_drift = steps.abs();
        self
    }

    #[must_use]
    pub fn issuer_name(&self) -> &str {
        &self.issuer_name
    }

    #[must_use]
    pub fn login_form_kind(device: &Device) -> LoginFormKind {
        device.login_form_kind()
    }

    /// Prepare whatever the user needs to answer. Out-of-band delivery is
    /// queued, never awaited.
    ///
    /// # Errors
    /// Returns an error if key material is corrupt or randomness fails.
    pub async fn generate_challenge(&self, device: &Device) -> Result<ChallengeMaterial> {
        match &device.kind {
            DeviceKind::Totp(_) => Ok(ChallengeMaterial::None),
            DeviceKind::OutOfBand(params) => {
                let message =
                    out_of_band::message(params, &self.issuer_name, Utc::now().timestamp())?;
                let receipt = message.receipt;
                if !self.notifier.dispatch(message) {
                    warn!(device_id = %device.id, %receipt, "out-of-band code not queued");
                }
                Ok(ChallengeMaterial::Delivered {
                    receipt,
                    target_hint: mask_target(&params.target),
                })
            }
            DeviceKind::HardwareKey(params) => {
                let challenge = secret::random_bytes(32)?;
                let encoded = URL_SAFE_NO_PAD.encode(&challenge);
                self.pending.insert(device.id, challenge).await;
                Ok(ChallengeMaterial::Assertion {
                    challenge: encoded,
                    app_id: params.app_id.clone(),
                    key_handle: params.key_handle.clone(),
                })
            }
        }
    }

    /// Check a response and persist the device's new state. A one-time code
    /// is accepted at most once; losing the counter race is a rejection.
    ///
    /// # Errors
    /// Returns an error on storage failure or corrupt key material.
    pub async fn verify_token(&self, device: &Device, presented: &str) -> Result<bool> {
        let now = Utc::now();
        let update = match &device.kind {
            DeviceKind::Totp(params) => {
                let key = totp::decode_key(&params.key)?;
                let window = totp::OtpWindow::from(params);
                totp::scan(&key, &window, now.timestamp(), presented)?.map(|found| CounterUpdate {
                    device_id: device.id,
                    user_id: device.user_id,
                    expected_last_t: Some(params.last_t),
                    last_t: Some(found.t),
                    drift: Some(totp::next_drift(params.drift, found.offset, self.max_drift)),
                    last_used: now,
                    confirm: !device.confirmed,
                })
            }
            DeviceKind::OutOfBand(params) => {
                let key = totp::decode_key(&params.key)?;
                let window = out_of_band::window(params);
                totp::scan(&key, &window, now.timestamp(), presented)?.map(|found| CounterUpdate {
                    device_id: device.id,
                    user_id: device.user_id,
                    expected_last_t: Some(params.last_t),
                    last_t: Some(found.t),
                    drift: None,
                    last_used: now,
                    confirm: !device.confirmed,
                })
            }
            DeviceKind::HardwareKey(params) => {
                let challenge = self.pending.take(device.id).await;
                let assertion = hardware_key::decode_assertion(presented);
                match (challenge, assertion) {
                    (Some(challenge), Some(signature))
                        if self.verifier.verify(params, &challenge, &signature) =>
                    {
                        Some(CounterUpdate {
                            device_id: device.id,
                            user_id: device.user_id,
                            expected_last_t: None,
                            last_t: None,
                            drift: None,
                            last_used: now,
                            confirm: !device.confirmed,
                        })
                    }
                    _ => None,
                }
            }
        };

        let Some(update) = update else {
            warn!(device_id = %device.id, "MFA verification failed");
            return Ok(false);
        };
        if self.store.record_device_use(&update).await? {
            debug!(device_id = %device.id, "MFA verification succeeded");
            Ok(true)
        } else {
            warn!(device_id = %device.id, "MFA verification lost a concurrent update");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mfa::device::{
        HARDWARE_KEY_VERSION, HardwareKeyParams, INITIAL_LAST_T, OutOfBandParams, TotpParams,
    };
    use crate::notify::Notification;
    use crate::store::memory::MemoryStore;
    use anyhow::bail;
    use ed25519_dalek::{Signer, SigningKey};
    use tokio::sync::mpsc;

    const KEY_HEX: &str = "3132333435363738393031323334353637383930";

    struct Harness {
        store: Arc<MemoryStore>,
        engine: ChallengeEngine,
        outbox: mpsc::Receiver<Notification>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (tx, outbox) = mpsc::channel(8);
        let engine = ChallengeEngine::new(
            store.clone(),
            Notifier::new(tx),
            Arc::new(hardware_key::Ed25519AssertionVerifier),
        );
        Harness { store, engine, outbox }
    }

    async fn totp_device(store: &MemoryStore) -> Result<Device> {
        let mut device = Device::new(
            Uuid::new_v4(),
            "phone",
            DeviceKind::Totp(TotpParams::new(KEY_HEX.to_string(), 6)),
        );
        device.confirmed = true;
        store.insert_device(&device).await?;
        Ok(device)
    }

    fn code_for(offset: i64) -> Result<String> {
        let key = totp::decode_key(KEY_HEX)?;
        let t = totp::current_step(Utc::now().timestamp(), 0, 30) + offset;
        totp::code_at(&key, t, 30, 6)
    }

    async fn reload(store: &MemoryStore, device: &Device) -> Result<Device> {
        match store.find_device(device.user_id, device.id).await? {
            Some(device) => Ok(device),
            None => bail!("device vanished"),
        }
    }

    #[tokio::test]
    async fn same_code_twice_fails_second_time() -> Result<()> {
        let h = harness();
        let device = totp_device(&h.store).await?;
        let code = code_for(0)?;
        assert!(h.engine.verify_token(&device, &code).await?);
        let device = reload(&h.store, &device).await?;
        assert!(!h.engine.verify_token(&device, &code).await?);
        Ok(())
    }

    #[tokio::test]
    async fn stale_device_copy_cannot_replay() -> Result<()> {
        let h = harness();
        let device = totp_device(&h.store).await?;
        let code = code_for(0)?;
        assert!(h.engine.verify_token(&device, &code).await?);
        assert!(!h.engine.verify_token(&device, &code).await?);
        Ok(())
    }

    #[tokio::test]
    async fn nonzero_offset_updates_drift_once() -> Result<()> {
        let h = harness();
        let device = totp_device(&h.store).await?;
        assert!(h.engine.verify_token(&device, &code_for(1)?).await?);
        let device = reload(&h.store, &device).await?;
        let DeviceKind::Totp(params) = &device.kind else {
            bail!("not a totp device");
        };
        assert_eq!(params.drift, 1);
        let accepted_t = params.last_t;

        // Next step is now the drift-corrected current step.
        assert!(!h.engine.verify_token(&device, &code_for(1)?).await?);
        let device = reload(&h.store, &device).await?;
        let DeviceKind::Totp(params) = &device.kind else {
            bail!("not a totp device");
        };
        assert_eq!(params.drift, 1);
        assert_eq!(params.last_t, accepted_t);
        Ok(())
    }

    #[tokio::test]
    async fn outside_tolerance_leaves_device_unchanged() -> Result<()> {
        let h = harness();
        let device = totp_device(&h.store).await?;
        assert!(!h.engine.verify_token(&device, &code_for(2)?).await?);
        assert_eq!(reload(&h.store, &device).await?, device);
        Ok(())
    }

    #[tokio::test]
    async fn out_of_band_round_trip() -> Result<()> {
        let mut h = harness();
        let mut device = Device::new(
            Uuid::new_v4(),
            "sms",
            DeviceKind::OutOfBand(OutOfBandParams {
                target: "+15551234567".to_string(),
                key: KEY_HEX.to_string(),
                last_t: INITIAL_LAST_T,
            }),
        );
        device.confirmed = true;
        h.store.insert_device(&device).await?;

        let material = h.engine.generate_challenge(&device).await?;
        let ChallengeMaterial::Delivered { receipt, target_hint } = material else {
            bail!("expected a delivery receipt");
        };
        assert_eq!(target_hint, "********4567");
        let Some(sent) = h.outbox.recv().await else {
            bail!("nothing queued");
        };
        assert_eq!(sent.receipt, receipt);
        let code: String = sent.body.chars().take(6).collect();
        assert!(h.engine.verify_token(&device, &code).await?);
        let device = reload(&h.store, &device).await?;
        assert!(!h.engine.verify_token(&device, &code).await?);
        Ok(())
    }

    #[tokio::test]
    async fn hardware_key_challenge_is_single_use() -> Result<()> {
        let h = harness();
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let params = HardwareKeyParams {
            public_key: key.verifying_key().to_bytes().to_vec(),
            key_handle: "kh".to_string(),
            app_id: "https://sso.example.com".to_string(),
            version: HARDWARE_KEY_VERSION.to_string(),
        };
        let mut device = Device::new(Uuid::new_v4(), "key", DeviceKind::HardwareKey(params.clone()));
        device.confirmed = true;
        h.store.insert_device(&device).await?;

        let ChallengeMaterial::Assertion { challenge, .. } = h.engine.generate_challenge(&device).await? else {
            bail!("expected an assertion request");
        };
        let challenge = URL_SAFE_NO_PAD.decode(challenge)?;
        let signature = key.sign(&hardware_key::signed_message(&params, &challenge));
        let response = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        assert!(h.engine.verify_token(&device, &response).await?);
        assert!(!h.engine.verify_token(&device, &response).await?);
        Ok(())
    }

    #[tokio::test]
    async fn first_valid_code_confirms_device() -> Result<()> {
        let h = harness();
        let device = Device::new(
            Uuid::new_v4(),
            "phone",
            DeviceKind::Totp(TotpParams::new(KEY_HEX.to_string(), 6)),
        );
        h.store.insert_device(&device).await?;
        assert!(h.engine.verify_token(&device, &code_for(0)?).await?);
        assert!(reload(&h.store, &device).await?.confirmed);
        Ok(())
    }
}
