#![allow(dead_code)]

use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, StatusCode, header},
};
use chrono::Utc;
use serde_json::Value;
use sso::{
    api::{
        self,
        state::{AppState, AuthConfig},
    },
    directory::{MemoryDirectory, User},
    mfa::{
        Device, DeviceKind, Profile,
        device::TotpParams,
        totp,
    },
    notify::{Notification, Notifier},
    oauth2::{Client, ClientType, ScopeSet},
    session::KeyMaterial,
    store::{DeviceStore, memory::MemoryStore},
    throttle::{NoopRateLimiter, RateLimiter},
};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tower::ServiceExt;
use uuid::Uuid;

pub const ISSUER: &str = "https://sso.example.com";
pub const PASSWORD: &str = "correct horse battery staple";
pub const SPA_REDIRECT: &str = "https://app.example.com/callback";
pub const WEB_REDIRECT: &str = "https://web.example.com/cb";
pub const WEB_SECRET: &str = "web-secret";
pub const TOTP_KEY_HEX: &str = "3132333435363738393031323334353637383930";

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub directory: Arc<MemoryDirectory>,
    pub outbox: Mutex<mpsc::Receiver<Notification>>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_limiter(Arc::new(NoopRateLimiter)).await
    }

    pub async fn with_limiter(limiter: Arc<dyn RateLimiter>) -> Result<Self> {
        Self::build(limiter, |config| config).await
    }

    pub async fn with_config(configure: impl FnOnce(AuthConfig) -> AuthConfig) -> Result<Self> {
        Self::build(Arc::new(NoopRateLimiter), configure).await
    }

    async fn build(
        limiter: Arc<dyn RateLimiter>,
        configure: impl FnOnce(AuthConfig) -> AuthConfig,
    ) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let keys = KeyMaterial::from_bytes(&[7u8; 32])?;
        let (tx, rx) = mpsc::channel(16);

        store
            .insert_client(
                Client::new("spa", "Single page app", ClientType::SinglePage)
                    .with_redirect_uri(SPA_REDIRECT)
                    .with_scopes(ScopeSet::parse("openid profile email")?),
            )
            .await;
        store
            .insert_client(
                Client::new("web", "Web app", ClientType::Web)
                    .with_secret(WEB_SECRET)
                    .with_redirect_uri(WEB_REDIRECT)
                    .with_scopes(ScopeSet::parse("openid profile permissions")?),
            )
            .await;

        let config = configure(AuthConfig::new(ISSUER).with_login_url(format!("{ISSUER}/login")));
        let state = Arc::new(AppState::new(
            config,
            store.clone(),
            directory.clone(),
            &keys,
            Notifier::new(tx),
            limiter,
        )?);

        Ok(Self {
            app: api::app(state.clone()),
            state,
            store,
            directory,
            outbox: Mutex::new(rx),
        })
    }

    pub async fn add_user(&self, username: &str) -> Result<User> {
        let user = User::new(username, format!("{username}@example.com")).with_name(username);
        self.directory.insert(user, PASSWORD).await
    }

    /// Confirmed TOTP device set as default with MFA switched on.
    pub async fn add_totp_device(&self, user_id: Uuid) -> Result<Device> {
        let mut device = Device::new(
            user_id,
            "phone",
            DeviceKind::Totp(TotpParams::new(TOTP_KEY_HEX.to_string(), 6)),
        );
        device.confirmed = true;
        self.store.insert_device(&device).await?;
        let mut profile = Profile::new(user_id);
        profile.default_device = Some(device.id);
        profile.mfa_enabled = true;
        self.store.save_profile(&profile).await?;
        Ok(device)
    }

    pub async fn send(&self, request: Request<Body>) -> Result<Response<Body>> {
        Ok(self.app.clone().oneshot(request).await?)
    }

    pub async fn post_form(&self, uri: &str, pairs: &[(&str, &str)]) -> Result<Response<Body>> {
        self.send(form_request(uri, pairs, None)?).await
    }

    pub async fn get(&self, uri: &str, cookie: Option<&str>) -> Result<Response<Body>> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.send(builder.body(Body::empty())?).await
    }

    /// Password login without MFA; returns the `name=value` cookie pair.
    pub async fn sign_in(&self, username: &str) -> Result<String> {
        let response = self
            .post_form(
                "/v1/auth/login",
                &[("identifier", username), ("password", PASSWORD)],
            )
            .await?;
        if response.status() != StatusCode::OK {
            return Err(anyhow!("login failed with {}", response.status()));
        }
        session_cookie(&response).context("login did not set a session cookie")
    }
}

pub fn form_request(uri: &str, pairs: &[(&str, &str)], basic: Option<(&str, &str)>) -> Result<Request<Body>> {
    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some((id, secret)) = basic {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{id}:{secret}"));
        builder = builder.header(header::AUTHORIZATION, format!("Basic {encoded}"));
    }
    Ok(builder.body(Body::from(body))?)
}

pub async fn json_body(response: Response<Body>) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn field<'a>(value: &'a Value, name: &str) -> Result<&'a str> {
    value
        .get(name)
        .and_then(Value::as_str)
        .with_context(|| format!("missing string field {name} in {value}"))
}

/// `name=value` of the first `Set-Cookie`.
pub fn session_cookie(response: &Response<Body>) -> Option<String> {
    let value = response.headers().get(header::SET_COOKIE)?.to_str().ok()?;
    value.split(';').next().map(str::to_string)
}

pub fn location(response: &Response<Body>) -> Result<url::Url> {
    let value = response
        .headers()
        .get(header::LOCATION)
        .context("missing Location header")?
        .to_str()?;
    Ok(url::Url::parse(value).or_else(|_| url::Url::parse(ISSUER)?.join(value))?)
}

pub fn query_param(url: &url::Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// TOTP code for the seeded key, `offset` steps away from now.
pub fn totp_code(offset: i64) -> Result<String> {
    let key = totp::decode_key(TOTP_KEY_HEX)?;
    let t = totp::current_step(Utc::now().timestamp(), 0, 30) + offset;
    totp::code_at(&key, t, 30, 6)
}
