//! Hardware keys: server-held challenges and signature assertions.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::device::HardwareKeyParams;

pub const CHALLENGE_TTL: Duration = Duration::from_secs(5 * 60);

/// Checks an assertion produced by the key for a challenge.
pub trait AssertionVerifier: Send + Sync {
    fn verify(&self, params: &HardwareKeyParams, challenge: &[u8], signature: &[u8]) -> bool;
}

/// Keys sign `app_id || challenge || key_handle` with Ed25519.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519AssertionVerifier;

#[must_use]
pub fn signed_message(params: &HardwareKeyParams, challenge: &[u8]) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(params.app_id.len() + challenge.len() + params.key_handle.len());
    message.extend_from_slice(params.app_id.as_bytes());
    message.extend_from_slice(challenge);
    message.extend_from_slice(params.key_handle.as_bytes());
    message
}

impl AssertionVerifier for Ed25519AssertionVerifier {
    fn verify(&self, params: &HardwareKeyParams, challenge: &[u8], signature: &[u8]) -> bool {
        let Ok(public_key) = <[u8; 32]>::try_from(params.public_key.as_slice()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(&signed_message(params, challenge), &signature)
            .is_ok()
    }
}

struct Pending {
    challenge: Vec<u8>,
    created_at: Instant,
}

/// Outstanding challenges, one per device, single use.
pub struct PendingChallenges {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, Pending>>,
}

impl Default for PendingChallenges {
    fn default() -> Self {
        Self::new(CHALLENGE_TTL)
    }
}

impl PendingChallenges {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the device's outstanding challenge.
    pub async fn insert(&self, device_id: Uuid, challenge: Vec<u8>) {
        let mut entries = self.entries.lock().await;
        let ttl = self.ttl;
        entries.retain(|_, pending| pending.created_at.elapsed() <= ttl);
        entries.insert(
            device_id,
            Pending {
                challenge,
                created_at: Instant::now(),
            },
        );
    }

    /// Remove and return the challenge if it has not expired.
    pub async fn take(&self, device_id: Uuid) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().await;
        let pending = entries.remove(&device_id)?;
        (pending.created_at.elapsed() <= self.ttl).then_some(pending.challenge)
    }
}

/// Assertions travel as base64url.
#[must_use]
pub fn decode_assertion(presented: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(presented.trim()).ok()
}
