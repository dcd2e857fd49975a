//! Step-up login: primary credentials, then an MFA challenge when required.
//!
//! Between the two steps the user carries a short-lived signed state blob
//! (`sub`, chosen device, `next`). Nothing is stored server-side, so a blob
//! stays usable after a wrong answer until it expires.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::directory::{User, UserDirectory};
use crate::mfa::{ChallengeMaterial, Device, DeviceError, DeviceRegistry, DeviceSummary};
use crate::session::codec::{self, CLAIMS_VERSION};
use crate::session::signer::Signer;
use crate::throttle::{NoopRateLimiter, RateLimiter, ThrottleAction, ThrottleDecision};

pub const DEFAULT_LOGIN_STATE_TTL_SECONDS: i64 = 300;

/// When primary authentication alone is not enough.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MfaPolicy {
    #[default]
    None,
    AdminOnly,
    All,
}

impl MfaPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AdminOnly => "admin-only",
            Self::All => "all",
        }
    }

    fn requires(self, user: &User) -> bool {
        match self {
            Self::None => false,
            Self::AdminOnly => user.is_admin,
            Self::All => true,
        }
    }
}

impl FromStr for MfaPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "admin-only" | "admin_only" => Ok(Self::AdminOnly),
            "all" => Ok(Self::All),
            other => Err(format!("unknown MFA policy: {other}")),
        }
    }
}

/// Signed state between the password step and the challenge step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoginState {
    pub ver: u8,
    pub sub: Uuid,
    pub dev: Uuid,
    pub next: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct Authenticated {
    pub user: User,
    /// Device that answered the challenge, bound into the session.
    pub device_id: Option<Uuid>,
    pub auth_time: DateTime<Utc>,
    pub next: String,
}

#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub state: String,
    pub device: DeviceSummary,
    pub material: ChallengeMaterial,
    pub alternatives: Vec<DeviceSummary>,
    pub next: String,
}

#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated(Authenticated),
    AwaitingChallenge(PendingChallenge),
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("login state expired or invalid")]
    Expired,
    #[error("challenge response rejected")]
    ChallengeFailed,
    #[error("multi-factor enrollment required")]
    MfaEnrollmentRequired,
    #[error("too many attempts")]
    Throttled { retry_after_seconds: u64 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<DeviceError> for LoginError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::NotFound | DeviceError::NotConfirmed => Self::ChallengeFailed,
            DeviceError::Store(err) => Self::Internal(err.into()),
            DeviceError::Internal(err) => Self::Internal(err),
            other => Self::Internal(anyhow!(other.to_string())),
        }
    }
}

/// Keep `next` only when it stays on this site.
#[must_use]
pub fn safe_next(next: Option<&str>, issuer: &str) -> String {
    let Some(next) = next.map(str::trim).filter(|next| !next.is_empty()) else {
        return "/".to_string();
    };
    if next.starts_with('/') && !next.starts_with("//") && !next.contains('\\') {
        return next.to_string();
    }
    match (Url::parse(next), Url::parse(issuer)) {
        (Ok(target), Ok(issuer)) if target.origin() == issuer.origin() => next.to_string(),
        _ => "/".to_string(),
    }
}

#[derive(Clone)]
pub struct LoginOrchestrator {
    directory: Arc<dyn UserDirectory>,
    devices: DeviceRegistry,
    state_signer: Signer,
    issuer: String,
    state_ttl_seconds: i64,
    policy: MfaPolicy,
    limiter: Arc<dyn RateLimiter>,
}

impl std::fmt::Debug for LoginOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginOrchestrator")
            .field("issuer", &self.issuer)
            .field("state_ttl_seconds", &self.state_ttl_seconds)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl LoginOrchestrator {
    #[must_use]
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        devices: DeviceRegistry,
        state_signer: Signer,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            devices,
            state_signer,
            issuer: issuer.into(),
            state_ttl_seconds: DEFAULT_LOGIN_STATE_TTL_SECONDS,
            policy: MfaPolicy::None,
            limiter: Arc::new(NoopRateLimiter),
        }
    }

    #[must_use]
    pub fn with_state_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.state_ttl_seconds = ttl_seconds.max(1);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: MfaPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Limits challenge answers per user.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    /// Verify primary credentials and decide whether a challenge follows.
    ///
    /// # Errors
    /// `InvalidCredentials` for unknown, inactive or wrong-password users,
    /// `MfaEnrollmentRequired` when policy demands a device the user lacks.
    pub async fn authenticate(
        &self,
        identifier: &str,
        password: &str,
        next: Option<&str>,
        force_step_up: bool,
    ) -> Result<LoginOutcome, LoginError> {
        let Some(user) = self
            .directory
            .verify_password(identifier, password)
            .await?
            .filter(|user| user.is_active)
        else {
            return Err(LoginError::InvalidCredentials);
        };
        let next = safe_next(next, &self.issuer);

        let profile = self.devices.profile(user.id).await?;
        let policy_requires = self.policy.requires(&user);
        let step_up = policy_requires || profile.mfa_enabled || force_step_up;

        let default_device = if step_up {
            self.devices.default_device(user.id).await?
        } else {
            None
        };
        let Some(device) = default_device else {
            if policy_requires {
                warn!(user_id = %user.id, policy = self.policy.as_str(), "MFA required but no confirmed device");
                return Err(LoginError::MfaEnrollmentRequired);
            }
            info!(user_id = %user.id, "primary authentication succeeded");
            return Ok(LoginOutcome::Authenticated(Authenticated {
                user,
                device_id: None,
                auth_time: Utc::now(),
                next,
            }));
        };

        let now = Utc::now().timestamp();
        let state = LoginState {
            ver: CLAIMS_VERSION,
            sub: user.id,
            dev: device.id,
            next,
            iat: now,
            exp: now + self.state_ttl_seconds,
        };
        info!(user_id = %user.id, device_id = %device.id, "step-up challenge issued");
        self.challenge(state, &device).await.map(LoginOutcome::AwaitingChallenge)
    }

    /// Answer the pending challenge, optionally with another confirmed
    /// device than the one first offered.
    ///
    /// # Errors
    /// `Expired` for a tampered or stale state blob, `ChallengeFailed` for a
    /// wrong response or a device that is not the user's.
    pub async fn verify_challenge(
        &self,
        state: &str,
        device_id: Option<Uuid>,
        response: &str,
    ) -> Result<Authenticated, LoginError> {
        let claims = self.open_state(state)?;
        self.throttle(ThrottleAction::MfaVerify, claims.sub)?;

        let device = self.confirmed_device(claims.sub, device_id.unwrap_or(claims.dev)).await?;
        if !self.devices.challenges().verify_token(&device, response).await? {
            return Err(LoginError::ChallengeFailed);
        }

        let Some(user) = self
            .directory
            .find_user_by_id(claims.sub)
            .await?
            .filter(|user| user.is_active)
        else {
            return Err(LoginError::InvalidCredentials);
        };
        info!(user_id = %user.id, device_id = %device.id, "step-up authentication succeeded");
        Ok(Authenticated {
            user,
            device_id: Some(device.id),
            auth_time: Utc::now(),
            next: claims.next,
        })
    }

    /// Issue a fresh challenge (new SMS, new hardware-key nonce), possibly
    /// switching devices. The new state keeps the original expiry.
    ///
    /// # Errors
    /// `Expired` or `ChallengeFailed` as for [`Self::verify_challenge`];
    /// `Throttled` once the user has asked for too many new challenges.
    pub async fn resend_challenge(
        &self,
        state: &str,
        device_id: Option<Uuid>,
    ) -> Result<PendingChallenge, LoginError> {
        let claims = self.open_state(state)?;
        self.throttle(ThrottleAction::MfaResend, claims.sub)?;
        let device = self.confirmed_device(claims.sub, device_id.unwrap_or(claims.dev)).await?;
        let state = LoginState {
            dev: device.id,
            iat: Utc::now().timestamp(),
            ..claims
        };
        self.challenge(state, &device).await
    }

    fn throttle(&self, action: ThrottleAction, user_id: Uuid) -> Result<(), LoginError> {
        match self.limiter.check(action, &user_id.to_string()) {
            ThrottleDecision::Allowed => Ok(()),
            ThrottleDecision::Limited {
                retry_after_seconds,
            } => {
                warn!(user_id = %user_id, action = ?action, "login step throttled");
                Err(LoginError::Throttled {
                    retry_after_seconds,
                })
            }
        }
    }

    async fn challenge(&self, state: LoginState, device: &Device) -> Result<PendingChallenge, LoginError> {
        let material = self.devices.challenges().generate_challenge(device).await?;
        let profile = self.devices.profile(state.sub).await?;
        let alternatives = self
            .devices
            .confirmed(state.sub)
            .await?
            .into_iter()
            .filter(|other| other.id != device.id)
            .map(|other| other.summary(profile.default_device))
            .collect();
        let sealed = codec::seal(&self.state_signer, &state)?;
        Ok(PendingChallenge {
            state: sealed,
            device: device.summary(profile.default_device),
            material,
            alternatives,
            next: state.next,
        })
    }

    async fn confirmed_device(&self, user_id: Uuid, device_id: Uuid) -> Result<Device, LoginError> {
        let device = self.devices.get(user_id, device_id).await?;
        if device.confirmed {
            Ok(device)
        } else {
            Err(LoginError::ChallengeFailed)
        }
    }

    fn open_state(&self, state: &str) -> Result<LoginState, LoginError> {
        let claims: LoginState =
            codec::open(&self.state_signer, state).map_err(|_| LoginError::Expired)?;
        if claims.ver != CLAIMS_VERSION || claims.exp <= Utc::now().timestamp() {
            return Err(LoginError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::mfa::ChallengeEngine;
    use crate::mfa::device::{DeviceKind, Profile, TotpParams};
    use crate::mfa::hardware_key::Ed25519AssertionVerifier;
    use crate::mfa::totp;
    use crate::notify::Notifier;
    use crate::session::signer::{KeyMaterial, PURPOSE_LOGIN_STATE, PURPOSE_SESSION};
    use crate::store::DeviceStore;
    use crate::store::memory::MemoryStore;
    use crate::throttle::WindowRateLimiter;
    use anyhow::{Result, bail};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ISSUER: &str = "https://sso.example.com";
    const KEY_HEX: &str = "3132333435363738393031323334353637383930";

    struct Fixture {
        orchestrator: LoginOrchestrator,
        store: Arc<MemoryStore>,
        directory: Arc<MemoryDirectory>,
    }

    fn fixture(policy: MfaPolicy) -> Result<Fixture> {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let (tx, _rx) = mpsc::channel(8);
        let challenges =
            ChallengeEngine::new(store.clone(), Notifier::new(tx), Arc::new(Ed25519AssertionVerifier));
        let devices = DeviceRegistry::new(store.clone(), challenges);
        let material = KeyMaterial::from_bytes(&[7u8; 32])?;
        let signer = Signer::new(material.derive(PURPOSE_LOGIN_STATE)?);
        let orchestrator = LoginOrchestrator::new(directory.clone(), devices, signer, ISSUER)
            .with_policy(policy);
        Ok(Fixture {
            orchestrator,
            store,
            directory,
        })
    }

    async fn enroll_totp(store: &MemoryStore, user_id: Uuid) -> Result<Device> {
        let mut device = Device::new(
            user_id,
            "phone",
            DeviceKind::Totp(TotpParams::new(KEY_HEX.to_string(), 6)),
        );
        device.confirmed = true;
        store.insert_device(&device).await?;
        store
            .save_profile(&Profile {
                user_id,
                default_device: Some(device.id),
                mfa_enabled: true,
            })
            .await?;
        Ok(device)
    }

    fn code_for(offset: i64) -> Result<String> {
        let key = totp::decode_key(KEY_HEX)?;
        let t = totp::current_step(Utc::now().timestamp(), 0, 30) + offset;
        totp::code_at(&key, t, 30, 6)
    }

    #[tokio::test]
    async fn password_only_when_no_step_up() -> Result<()> {
        let fixture = fixture(MfaPolicy::None)?;
        fixture
            .directory
            .insert(User::new("alice", "alice@example.com"), "pw")
            .await?;

        let outcome = fixture
            .orchestrator
            .authenticate("alice", "pw", Some("https://evil.example.net/"), false)
            .await?;
        let LoginOutcome::Authenticated(authenticated) = outcome else {
            bail!("expected immediate authentication");
        };
        assert_eq!(authenticated.device_id, None);
        assert_eq!(authenticated.next, "/");

        assert!(matches!(
            fixture.orchestrator.authenticate("alice", "nope", None, false).await,
            Err(LoginError::InvalidCredentials)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn inactive_user_looks_like_bad_password() -> Result<()> {
        let fixture = fixture(MfaPolicy::None)?;
        fixture
            .directory
            .insert(User::new("bob", "bob@example.com").with_active(false), "pw")
            .await?;
        assert!(matches!(
            fixture.orchestrator.authenticate("bob", "pw", None, false).await,
            Err(LoginError::InvalidCredentials)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn policy_without_device_fails_closed() -> Result<()> {
        let fixture = fixture(MfaPolicy::AdminOnly)?;
        fixture
            .directory
            .insert(User::new("root", "root@example.com").with_admin(true), "pw")
            .await?;
        fixture
            .directory
            .insert(User::new("carol", "carol@example.com"), "pw")
            .await?;
        assert!(matches!(
            fixture.orchestrator.authenticate("root", "pw", None, false).await,
            Err(LoginError::MfaEnrollmentRequired)
        ));
        assert!(matches!(
            fixture.orchestrator.authenticate("carol", "pw", None, false).await?,
            LoginOutcome::Authenticated(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn totp_step_up() -> Result<()> {
        let fixture = fixture(MfaPolicy::None)?;
        let user = fixture
            .directory
            .insert(User::new("alice", "alice@example.com"), "pw")
            .await?;
        let device = enroll_totp(&fixture.store, user.id).await?;

        let outcome = fixture
            .orchestrator
            .authenticate("alice", "pw", Some("/authorize?client_id=web"), false)
            .await?;
        let LoginOutcome::AwaitingChallenge(pending) = outcome else {
            bail!("expected a challenge");
        };
        assert_eq!(pending.device.id, device.id);
        assert_eq!(pending.material, ChallengeMaterial::None);
        assert!(pending.alternatives.is_empty());

        // Two steps back is outside the tolerance window.
        assert!(matches!(
            fixture
                .orchestrator
                .verify_challenge(&pending.state, None, &code_for(-2)?)
                .await,
            Err(LoginError::ChallengeFailed)
        ));
        let unchanged = fixture.store.find_device(user.id, device.id).await?;
        assert_eq!(unchanged.as_ref().and_then(Device::last_t), Some(-1));

        let code = code_for(0)?;
        let authenticated = fixture
            .orchestrator
            .verify_challenge(&pending.state, None, &code)
            .await?;
        assert_eq!(authenticated.device_id, Some(device.id));
        assert_eq!(authenticated.next, "/authorize?client_id=web");

        // Same code again is a replay.
        assert!(matches!(
            fixture
                .orchestrator
                .verify_challenge(&pending.state, None, &code)
                .await,
            Err(LoginError::ChallengeFailed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn tampered_or_foreign_state_is_expired() -> Result<()> {
        let fixture = fixture(MfaPolicy::None)?;
        let user = fixture
            .directory
            .insert(User::new("alice", "alice@example.com"), "pw")
            .await?;
        enroll_totp(&fixture.store, user.id).await?;

        assert!(matches!(
            fixture.orchestrator.verify_challenge("v1.abc.def", None, "123456").await,
            Err(LoginError::Expired)
        ));

        // A session-purpose signature must not open a login state.
        let material = KeyMaterial::from_bytes(&[7u8; 32])?;
        let session_signer = Signer::new(material.derive(PURPOSE_SESSION)?);
        let now = Utc::now().timestamp();
        let forged = codec::seal(
            &session_signer,
            &LoginState {
                ver: CLAIMS_VERSION,
                sub: user.id,
                dev: Uuid::new_v4(),
                next: "/".to_string(),
                iat: now,
                exp: now + 60,
            },
        )?;
        assert!(matches!(
            fixture.orchestrator.verify_challenge(&forged, None, "123456").await,
            Err(LoginError::Expired)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn resend_switches_device() -> Result<()> {
        let fixture = fixture(MfaPolicy::None)?;
        let user = fixture
            .directory
            .insert(User::new("alice", "alice@example.com"), "pw")
            .await?;
        let first = enroll_totp(&fixture.store, user.id).await?;
        let mut second = Device::new(
            user.id,
            "sms",
            DeviceKind::Totp(TotpParams::new(KEY_HEX.to_string(), 6)),
        );
        second.confirmed = true;
        second.order = 1;
        fixture.store.insert_device(&second).await?;

        let LoginOutcome::AwaitingChallenge(pending) = fixture
            .orchestrator
            .authenticate("alice", "pw", None, true)
            .await?
        else {
            bail!("expected a challenge");
        };
        assert_eq!(pending.device.id, first.id);
        assert_eq!(pending.alternatives.len(), 1);

        let switched = fixture
            .orchestrator
            .resend_challenge(&pending.state, Some(second.id))
            .await?;
        assert_eq!(switched.device.id, second.id);

        assert!(matches!(
            fixture
                .orchestrator
                .resend_challenge(&pending.state, Some(Uuid::new_v4()))
                .await,
            Err(LoginError::ChallengeFailed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn resend_is_throttled_per_user() -> Result<()> {
        let mut fixture = fixture(MfaPolicy::None)?;
        fixture.orchestrator = fixture
            .orchestrator
            .with_rate_limiter(Arc::new(WindowRateLimiter::new(Duration::from_secs(60), 1)));
        let user = fixture
            .directory
            .insert(User::new("alice", "alice@example.com"), "pw")
            .await?;
        enroll_totp(&fixture.store, user.id).await?;
        let LoginOutcome::AwaitingChallenge(pending) = fixture
            .orchestrator
            .authenticate("alice", "pw", None, false)
            .await?
        else {
            bail!("expected a challenge");
        };

        fixture.orchestrator.resend_challenge(&pending.state, None).await?;
        assert!(matches!(
            fixture.orchestrator.resend_challenge(&pending.state, None).await,
            Err(LoginError::Throttled { .. })
        ));
        // Verification has its own budget.
        let verified = fixture
            .orchestrator
            .verify_challenge(&pending.state, None, &code_for(0)?)
            .await?;
        assert_eq!(verified.user.id, user.id);
        Ok(())
    }

    #[test]
    fn next_is_kept_on_site() {
        assert_eq!(safe_next(None, ISSUER), "/");
        assert_eq!(safe_next(Some("/a?b=c"), ISSUER), "/a?b=c");
        assert_eq!(safe_next(Some("//evil.example.net"), ISSUER), "/");
        assert_eq!(safe_next(Some("/\\evil.example.net"), ISSUER), "/");
        assert_eq!(
            safe_next(Some("https://sso.example.com/authorize"), ISSUER),
            "https://sso.example.com/authorize"
        );
        assert_eq!(safe_next(Some("https://evil.example.net/"), ISSUER), "/");
        assert_eq!(safe_next(Some("javascript:alert(1)"), ISSUER), "/");
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("admin-only".parse::<MfaPolicy>(), Ok(MfaPolicy::AdminOnly));
        assert_eq!("ALL".parse::<MfaPolicy>(), Ok(MfaPolicy::All));
        assert!("sometimes".parse::<MfaPolicy>().is_err());
    }
}
