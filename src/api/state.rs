//! Shared state for the HTTP handlers.
//!
//! `AuthConfig` holds the tunables parsed from the CLI; `AppState` wires the
//! engines to one store, one user directory and one key.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

use crate::directory::UserDirectory;
use crate::login::{LoginOrchestrator, MfaPolicy};
use crate::mfa::hardware_key::Ed25519AssertionVerifier;
use crate::mfa::{ChallengeEngine, DeviceRegistry};
use crate::notify::Notifier;
use crate::oauth2::id_token::IdTokenSigner;
use crate::oauth2::{Client, ClientRegistry, ClientType, CodeEngine, TokenEngine};
use crate::session::signer::{PURPOSE_LOGIN_STATE, PURPOSE_SESSION};
use crate::session::{KeyMaterial, SessionCodec, Signer};
use crate::store::Store;
use crate::throttle::RateLimiter;

pub const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 3600;
pub const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 30 * 24 * 3600;
pub const DEFAULT_CODE_TTL_SECONDS: i64 = 600;
pub const DEFAULT_SESSION_TTL_SECONDS: i64 = 24 * 3600;
pub const DEFAULT_SESSION_COOKIE_NAME: &str = "sso_session";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

impl SameSite {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lax => "Lax",
            Self::Strict => "Strict",
            Self::None => "None",
        }
    }
}

impl FromStr for SameSite {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lax" => Ok(Self::Lax),
            "strict" => Ok(Self::Strict),
            "none" => Ok(Self::None),
            other => Err(format!("invalid SameSite value: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    issuer: String,
    login_url: String,
    access_token_ttl_seconds: i64,
    refresh_token_ttl_seconds: i64,
    code_ttl_seconds: i64,
    session_ttl_seconds: i64,
    login_state_ttl_seconds: i64,
    session_cookie_name: String,
    session_cookie_same_site: SameSite,
    session_cookie_http_only: bool,
    pkce_required_client_types: Vec<ClientType>,
    mfa_policy: MfaPolicy,
    totp_max_drift_steps: i64,
    refresh_reuse_detection: bool,
    userinfo_clients: Vec<String>,
}

impl AuthConfig {
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into().trim_end_matches('/').to_string(),
            login_url: "/login".to_string(),
            access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            refresh_token_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            code_ttl_seconds: DEFAULT_CODE_TTL_SECONDS,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            login_state_ttl_seconds: crate::login::DEFAULT_LOGIN_STATE_TTL_SECONDS,
            session_cookie_name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
            session_cookie_same_site: SameSite::Lax,
            session_cookie_http_only: true,
            pkce_required_client_types: vec![ClientType::SinglePage, ClientType::Native],
            mfa_policy: MfaPolicy::None,
            totp_max_drift_steps: crate::mfa::challenge::DEFAULT_MAX_DRIFT_STEPS,
            refresh_reuse_detection: true,
            userinfo_clients: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = login_url.into();
        self
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.access_token_ttl_seconds = ttl_seconds.max(1);
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.refresh_token_ttl_seconds = ttl_seconds.max(1);
        self
    }

    #[must_use]
    pub fn with_code_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.code_ttl_seconds = ttl_seconds.max(1);
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.session_ttl_seconds = ttl_seconds.max(1);
        self
    }

    #[must_use]
    pub fn with_login_state_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.login_state_ttl_seconds = ttl_seconds.max(1);
        self
    }

    #[must_use]
    pub fn with_session_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.session_cookie_name = name.into();
        self
    }

    #[must_use]
    pub fn with_session_cookie_same_site(mut self, same_site: SameSite) -> Self {
        self.session_cookie_same_site = same_site;
        self
    }

    #[must_use]
    pub fn with_session_cookie_http_only(mut self, http_only: bool) -> Self {
        self.session_cookie_http_only = http_only;
        self
    }

    #[must_use]
    pub fn with_pkce_required_client_types(mut self, types: Vec<ClientType>) -> Self {
        self.pkce_required_client_types = types;
        self
    }

    #[must_use]
    pub fn with_mfa_policy(mut self, policy: MfaPolicy) -> Self {
        self.mfa_policy = policy;
        self
    }

    #[must_use]
    pub fn with_totp_max_drift_steps(mut self, steps: i64) -> Self {
        self.totp_max_drift_steps = steps.abs();
        self
    }

    #[must_use]
    pub fn with_refresh_reuse_detection(mut self, enabled: bool) -> Self {
        self.refresh_reuse_detection = enabled;
        self
    }

    /// Restrict `/userinfo` to tokens of these clients. Empty allows all.
    #[must_use]
    pub fn with_userinfo_clients(mut self, clients: Vec<String>) -> Self {
        self.userinfo_clients = clients;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn userinfo_clients(&self) -> &[String] {
        &self.userinfo_clients
    }

    #[must_use]
    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    #[must_use]
    pub fn access_token_ttl_seconds(&self) -> i64 {
        self.access_token_ttl_seconds
    }

    #[must_use]
    pub fn refresh_token_ttl_seconds(&self) -> i64 {
        self.refresh_token_ttl_seconds
    }

    #[must_use]
    pub fn code_ttl_seconds(&self) -> i64 {
        self.code_ttl_seconds
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn login_state_ttl_seconds(&self) -> i64 {
        self.login_state_ttl_seconds
    }

    #[must_use]
    pub fn session_cookie_name(&self) -> &str {
        &self.session_cookie_name
    }

    #[must_use]
    pub fn session_cookie_same_site(&self) -> SameSite {
        self.session_cookie_same_site
    }

    #[must_use]
    pub fn session_cookie_http_only(&self) -> bool {
        self.session_cookie_http_only
    }

    /// Cookies are only marked secure when the issuer is served over HTTPS.
    #[must_use]
    pub fn session_cookie_secure(&self) -> bool {
        self.issuer.starts_with("https://")
    }

    #[must_use]
    pub fn mfa_policy(&self) -> MfaPolicy {
        self.mfa_policy
    }

    #[must_use]
    pub fn totp_max_drift_steps(&self) -> i64 {
        self.totp_max_drift_steps
    }

    #[must_use]
    pub fn refresh_reuse_detection(&self) -> bool {
        self.refresh_reuse_detection
    }

    #[must_use]
    pub fn pkce_required_client_types(&self) -> &[ClientType] {
        &self.pkce_required_client_types
    }

    /// Public clients always need PKCE; others when flagged or listed.
    #[must_use]
    pub fn pkce_required(&self, client: &Client) -> bool {
        !client.is_confidential()
            || client.pkce_required
            || self.pkce_required_client_types.contains(&client.client_type)
    }

    /// Issuer name shown in authenticator apps.
    #[must_use]
    pub fn display_name(&self) -> String {
        Url::parse(&self.issuer)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "SSO".to_string())
    }
}

pub struct AppState {
    config: AuthConfig,
    store: Arc<dyn Store>,
    directory: Arc<dyn UserDirectory>,
    clients: ClientRegistry,
    codes: CodeEngine,
    tokens: TokenEngine,
    id_tokens: IdTokenSigner,
    sessions: SessionCodec,
    login: LoginOrchestrator,
    limiter: Arc<dyn RateLimiter>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// # Errors
    /// Returns an error if signing keys cannot be derived.
    pub fn new<S: Store + 'static>(
        config: AuthConfig,
        store: Arc<S>,
        directory: Arc<dyn UserDirectory>,
        keys: &KeyMaterial,
        notifier: Notifier,
        limiter: Arc<dyn RateLimiter>,
    ) -> Result<Self> {
        let clients = ClientRegistry::new(store.clone());
        let codes = CodeEngine::new(store.clone(), store.clone(), config.code_ttl_seconds())
            .with_reuse_detection(config.refresh_reuse_detection());
        let tokens = TokenEngine::new(
            store.clone(),
            config.access_token_ttl_seconds(),
            config.refresh_token_ttl_seconds(),
        )
        .with_reuse_detection(config.refresh_reuse_detection());

        let challenges = ChallengeEngine::new(
            store.clone(),
            notifier,
            Arc::new(Ed25519AssertionVerifier),
        )
        .with_issuer_name(config.display_name())
        .with_max_drift(config.totp_max_drift_steps());
        let devices = DeviceRegistry::new(store.clone(), challenges);

        let session_signer = Signer::new(
            keys.derive(PURPOSE_SESSION)
                .context("failed to derive session key")?,
        );
        let state_signer = Signer::new(
            keys.derive(PURPOSE_LOGIN_STATE)
                .context("failed to derive login state key")?,
        );
        let sessions = SessionCodec::new(
            session_signer,
            config.issuer(),
            config.session_ttl_seconds(),
        );
        let id_tokens = IdTokenSigner::new(keys, config.issuer(), config.access_token_ttl_seconds())?;
        let login = LoginOrchestrator::new(directory.clone(), devices, state_signer, config.issuer())
            .with_state_ttl_seconds(config.login_state_ttl_seconds())
            .with_policy(config.mfa_policy())
            .with_rate_limiter(limiter.clone());

        Ok(Self {
            config,
            store,
            directory,
            clients,
            codes,
            tokens,
            id_tokens,
            sessions,
            login,
            limiter,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    #[must_use]
    pub fn codes(&self) -> &CodeEngine {
        &self.codes
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenEngine {
        &self.tokens
    }

    #[must_use]
    pub fn id_tokens(&self) -> &IdTokenSigner {
        &self.id_tokens
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionCodec {
        &self.sessions
    }

    #[must_use]
    pub fn login(&self) -> &LoginOrchestrator {
        &self.login
    }

    #[must_use]
    pub fn devices(&self) -> &DeviceRegistry {
        self.login.devices()
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }
}
