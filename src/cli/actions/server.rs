use crate::{
    api::{
        self,
        state::{AppState, AuthConfig},
    },
    cli::commands::{auth, notify},
    directory::PgDirectory,
    notify::{
        LogNotificationSender, NotificationSender, NotificationWorkerConfig,
        WebhookNotificationSender, spawn_notification_worker,
    },
    session::signer::KeyMaterial,
    store::{
        postgres::PgStore,
        prune::{PruneSchedule, spawn_prune_task},
    },
    throttle::WindowRateLimiter,
};
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub auth: auth::Options,
    pub notify: notify::Options,
}

impl Args {
    fn auth_config(&self) -> AuthConfig {
        let auth = &self.auth;
        AuthConfig::new(auth.issuer.clone())
            .with_login_url(auth.login_url.clone())
            .with_access_token_ttl_seconds(auth.access_token_ttl_seconds)
            .with_refresh_token_ttl_seconds(auth.refresh_token_ttl_seconds)
            .with_code_ttl_seconds(auth.code_ttl_seconds)
            .with_session_ttl_seconds(auth.session_ttl_seconds)
            .with_login_state_ttl_seconds(auth.login_state_ttl_seconds)
            .with_session_cookie_name(auth.session_cookie_name.clone())
            .with_session_cookie_same_site(auth.session_cookie_same_site)
            .with_session_cookie_http_only(auth.session_cookie_http_only)
            .with_pkce_required_client_types(auth.pkce_required_client_types.clone())
            .with_mfa_policy(auth.mfa_policy)
            .with_totp_max_drift_steps(auth.totp_max_drift_steps)
            .with_refresh_reuse_detection(auth.refresh_reuse_detection)
            .with_userinfo_clients(auth.userinfo_clients.clone())
    }

    fn prune_schedule(&self) -> PruneSchedule {
        let auth = &self.auth;
        PruneSchedule::new(
            auth.code_ttl_seconds,
            auth.access_token_ttl_seconds,
            auth.refresh_token_ttl_seconds,
        )
        .with_interval(Duration::from_secs(auth.prune_interval_seconds))
    }

    fn notification_config(&self) -> NotificationWorkerConfig {
        NotificationWorkerConfig::new()
            .with_max_attempts(self.notify.max_attempts)
            .with_backoff_base_seconds(self.notify.backoff_base_seconds)
            .with_backoff_max_seconds(self.notify.backoff_max_seconds)
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the signing key is invalid, the database is unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let keys = KeyMaterial::from_base64(
        args.auth.signing_key.expose_secret(),
        args.auth
            .previous_signing_key
            .as_ref()
            .map(|key| key.expose_secret()),
    )
    .context("Invalid signing key")?;

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&args.dsn)
        .await
        .context("Failed to connect to database")?;

    let sender: Arc<dyn NotificationSender> = match &args.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotificationSender::new(url.clone())?),
        None => Arc::new(LogNotificationSender),
    };
    let (notifier, _worker) = spawn_notification_worker(sender, args.notification_config());

    let limiter = Arc::new(WindowRateLimiter::new(
        Duration::from_secs(args.auth.throttle_window_seconds),
        args.auth.throttle_max_attempts,
    ));

    let store = Arc::new(PgStore::new(pool.clone()));
    let _pruner = spawn_prune_task(store.clone(), args.prune_schedule());

    let state = AppState::new(
        args.auth_config(),
        store,
        Arc::new(PgDirectory::new(pool)),
        &keys,
        notifier,
        limiter,
    )?;

    api::serve(args.port, Arc::new(state)).await
}

fn log_startup_args(args: &Args) {
    let policy = format!("{:?}", args.auth.mfa_policy).to_lowercase();
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        ("issuer", args.auth.issuer.clone()),
        ("login_url", args.auth.login_url.clone()),
        ("mfa_policy", policy),
        (
            "prune_interval",
            format!("{}s", args.auth.prune_interval_seconds),
        ),
        (
            "previous_signing_key_set",
            args.auth.previous_signing_key.is_some().to_string(),
        ),
        (
            "refresh_reuse_detection",
            args.auth.refresh_reuse_detection.to_string(),
        ),
        (
            "notify",
            args.notify
                .webhook_url
                .clone()
                .unwrap_or_else(|| "log".to_string()),
        ),
    ];
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "sso {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
