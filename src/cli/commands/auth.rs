use crate::api::state::SameSite;
use crate::login::MfaPolicy;
use crate::oauth2::ClientType;
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_ISSUER: &str = "issuer";
pub const ARG_LOGIN_URL: &str = "login-url";
pub const ARG_SIGNING_KEY: &str = "signing-key";
pub const ARG_PREVIOUS_SIGNING_KEY: &str = "previous-signing-key";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl-seconds";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl-seconds";
pub const ARG_CODE_TTL: &str = "authorization-code-ttl-seconds";
pub const ARG_SESSION_TTL: &str = "session-ttl-seconds";
pub const ARG_LOGIN_STATE_TTL: &str = "login-state-ttl-seconds";
pub const ARG_PRUNE_INTERVAL: &str = "prune-interval-seconds";
pub const ARG_COOKIE_NAME: &str = "session-cookie-name";
pub const ARG_COOKIE_SAME_SITE: &str = "session-cookie-same-site";
pub const ARG_COOKIE_HTTP_ONLY: &str = "session-cookie-http-only";
pub const ARG_PKCE_CLIENT_TYPES: &str = "pkce-required-client-types";
pub const ARG_MFA_POLICY: &str = "mfa-policy";
pub const ARG_TOTP_DRIFT: &str = "totp-max-drift-steps";
pub const ARG_REUSE_DETECTION: &str = "refresh-reuse-detection";
pub const ARG_USERINFO_CLIENTS: &str = "userinfo-clients";
pub const ARG_THROTTLE_WINDOW: &str = "throttle-window-seconds";
pub const ARG_THROTTLE_MAX_ATTEMPTS: &str = "throttle-max-attempts";

#[derive(Debug)]
pub struct Options {
    pub issuer: String,
    pub login_url: String,
    pub signing_key: SecretString,
    pub previous_signing_key: Option<SecretString>,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub code_ttl_seconds: i64,
    pub session_ttl_seconds: i64,
    pub login_state_ttl_seconds: i64,
    pub prune_interval_seconds: u64,
    pub session_cookie_name: String,
    pub session_cookie_same_site: SameSite,
    pub session_cookie_http_only: bool,
    pub pkce_required_client_types: Vec<ClientType>,
    pub mfa_policy: MfaPolicy,
    pub totp_max_drift_steps: i64,
    pub refresh_reuse_detection: bool,
    pub userinfo_clients: Vec<String>,
    pub throttle_window_seconds: u64,
    pub throttle_max_attempts: u32,
}

impl Options {
    /// Parse authentication arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the signing key is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };
        let get_i64 = |id: &str| matches.get_one::<i64>(id).copied().unwrap_or_default();

        let signing_key = get_non_empty(ARG_SIGNING_KEY)
            .map(SecretString::from)
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_SIGNING_KEY}"))?;

        Ok(Self {
            issuer: get_non_empty(ARG_ISSUER).unwrap_or_else(|| "http://localhost:8080".to_string()),
            login_url: get_non_empty(ARG_LOGIN_URL).unwrap_or_else(|| "/login".to_string()),
            signing_key,
            previous_signing_key: get_non_empty(ARG_PREVIOUS_SIGNING_KEY).map(SecretString::from),
            access_token_ttl_seconds: get_i64(ARG_ACCESS_TOKEN_TTL),
            refresh_token_ttl_seconds: get_i64(ARG_REFRESH_TOKEN_TTL),
            code_ttl_seconds: get_i64(ARG_CODE_TTL),
            session_ttl_seconds: get_i64(ARG_SESSION_TTL),
            login_state_ttl_seconds: get_i64(ARG_LOGIN_STATE_TTL),
            prune_interval_seconds: matches
                .get_one::<u64>(ARG_PRUNE_INTERVAL)
                .copied()
                .unwrap_or(300),
            session_cookie_name: get_non_empty(ARG_COOKIE_NAME)
                .unwrap_or_else(|| "sso_session".to_string()),
            session_cookie_same_site: matches
                .get_one::<SameSite>(ARG_COOKIE_SAME_SITE)
                .copied()
                .unwrap_or(SameSite::Lax),
            session_cookie_http_only: matches
                .get_one::<bool>(ARG_COOKIE_HTTP_ONLY)
                .copied()
                .unwrap_or(true),
            pkce_required_client_types: matches
                .get_many::<ClientType>(ARG_PKCE_CLIENT_TYPES)
                .map(|types| types.copied().collect())
                .unwrap_or_default(),
            mfa_policy: matches
                .get_one::<MfaPolicy>(ARG_MFA_POLICY)
                .copied()
                .unwrap_or(MfaPolicy::None),
            totp_max_drift_steps: get_i64(ARG_TOTP_DRIFT),
            refresh_reuse_detection: matches
                .get_one::<bool>(ARG_REUSE_DETECTION)
                .copied()
                .unwrap_or(true),
            userinfo_clients: matches
                .get_many::<String>(ARG_USERINFO_CLIENTS)
                .map(|clients| {
                    clients
                        .map(|client| client.trim().to_string())
                        .filter(|client| !client.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            throttle_window_seconds: matches
                .get_one::<u64>(ARG_THROTTLE_WINDOW)
                .copied()
                .unwrap_or(60),
            throttle_max_attempts: matches
                .get_one::<u32>(ARG_THROTTLE_MAX_ATTEMPTS)
                .copied()
                .unwrap_or(10),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_identity_args(command);
    let command = with_ttl_args(command);
    let command = with_cookie_args(command);
    with_policy_args(command)
}

fn with_identity_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ISSUER)
                .long(ARG_ISSUER)
                .help("Public base URL of this server, used as the token issuer")
                .env("SSO_ISSUER")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_LOGIN_URL)
                .long(ARG_LOGIN_URL)
                .help("Login page the authorization endpoint redirects to")
                .env("SSO_LOGIN_URL")
                .default_value("/login"),
        )
        .arg(
            Arg::new(ARG_SIGNING_KEY)
                .long(ARG_SIGNING_KEY)
                .help("Base64 signing key (at least 32 bytes) for sessions and ID tokens")
                .env("SSO_SIGNING_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_PREVIOUS_SIGNING_KEY)
                .long(ARG_PREVIOUS_SIGNING_KEY)
                .help("Previous signing key, still accepted for verification during rotation")
                .env("SSO_PREVIOUS_SIGNING_KEY")
                .hide_env_values(true),
        )
}

fn with_ttl_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Bearer token lifetime in seconds")
                .env("SSO_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token lifetime in seconds")
                .env("SSO_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_CODE_TTL)
                .long(ARG_CODE_TTL)
                .help("Authorization code lifetime in seconds")
                .env("SSO_AUTHORIZATION_CODE_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Session cookie TTL in seconds")
                .env("SSO_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOGIN_STATE_TTL)
                .long(ARG_LOGIN_STATE_TTL)
                .help("Time allowed between the password step and the MFA step, in seconds")
                .env("SSO_LOGIN_STATE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_PRUNE_INTERVAL)
                .long(ARG_PRUNE_INTERVAL)
                .help("Seconds between sweeps of expired codes and tokens")
                .env("SSO_PRUNE_INTERVAL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

fn with_cookie_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_COOKIE_NAME)
                .long(ARG_COOKIE_NAME)
                .help("Session cookie name")
                .env("SSO_SESSION_COOKIE_NAME")
                .default_value("sso_session"),
        )
        .arg(
            Arg::new(ARG_COOKIE_SAME_SITE)
                .long(ARG_COOKIE_SAME_SITE)
                .help("Session cookie SameSite attribute: lax, strict or none")
                .env("SSO_SESSION_COOKIE_SAME_SITE")
                .default_value("lax")
                .value_parser(|value: &str| value.parse::<SameSite>()),
        )
        .arg(
            Arg::new(ARG_COOKIE_HTTP_ONLY)
                .long(ARG_COOKIE_HTTP_ONLY)
                .help("Mark the session cookie HttpOnly")
                .env("SSO_SESSION_COOKIE_HTTP_ONLY")
                .default_value("true")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool)),
        )
}

fn with_policy_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PKCE_CLIENT_TYPES)
                .long(ARG_PKCE_CLIENT_TYPES)
                .help("Comma separated client types that must use PKCE")
                .env("SSO_PKCE_REQUIRED_CLIENT_TYPES")
                .default_value("single-page,native")
                .value_delimiter(',')
                .value_parser(|value: &str| value.parse::<ClientType>()),
        )
        .arg(
            Arg::new(ARG_MFA_POLICY)
                .long(ARG_MFA_POLICY)
                .help("Who must complete a second factor: none, admin-only or all")
                .env("SSO_MFA_POLICY")
                .default_value("none")
                .value_parser(|value: &str| value.parse::<MfaPolicy>()),
        )
        .arg(
            Arg::new(ARG_TOTP_DRIFT)
                .long(ARG_TOTP_DRIFT)
                .help("Largest clock drift, in TOTP steps, remembered per device")
                .env("SSO_TOTP_MAX_DRIFT_STEPS")
                .default_value("5")
                .value_parser(clap::value_parser!(i64).range(0..)),
        )
        .arg(
            Arg::new(ARG_REUSE_DETECTION)
                .long(ARG_REUSE_DETECTION)
                .help("Revoke the whole token family when a rotated refresh token is replayed")
                .env("SSO_REFRESH_REUSE_DETECTION")
                .default_value("true")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_USERINFO_CLIENTS)
                .long(ARG_USERINFO_CLIENTS)
                .help("Comma separated client ids allowed to call /userinfo; all when unset")
                .env("SSO_USERINFO_CLIENTS")
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_THROTTLE_WINDOW)
                .long(ARG_THROTTLE_WINDOW)
                .help("Rate limit window in seconds")
                .env("SSO_THROTTLE_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_THROTTLE_MAX_ATTEMPTS)
                .long(ARG_THROTTLE_MAX_ATTEMPTS)
                .help("Attempts allowed per key within one window")
                .env("SSO_THROTTLE_MAX_ATTEMPTS")
                .default_value("10")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
}
