//! # SSO (OAuth2/OIDC Authority with Step-Up MFA)
//!
//! `sso` authenticates end users, issues OAuth2/OIDC credentials to registered
//! clients, and enforces a multi-factor challenge before elevating trust.
//!
//! ## Credentials
//!
//! Authorization codes, bearer tokens and refresh tokens are opaque random
//! strings. Only their SHA-256 digests are persisted. Codes are single use;
//! refresh tokens rotate on every use and a replayed refresh token revokes the
//! whole token family.
//!
//! ## Sessions
//!
//! Browser sessions are stateless: the cookie carries versioned, HMAC-signed
//! claims (subject, bound MFA device, issue and expiry time, issuer). Rotating
//! the signing key is the only way to invalidate live sessions early.
//!
//! ## Multi-Factor Devices
//!
//! Users may register TOTP authenticators, out-of-band (SMS) devices and
//! hardware keys. One-time codes are bound to a strictly increasing time step
//! (`last_t`) so a code is never accepted twice.
//!
//! ## Collaborators
//!
//! User accounts live behind [`directory::UserDirectory`]; outbound messages
//! go through [`notify::NotificationSender`] on a background task.

pub mod api;
pub mod cli;
pub mod directory;
pub mod login;
pub mod mfa;
pub mod notify;
pub mod oauth2;
pub mod secret;
pub mod session;
pub mod store;
pub mod throttle;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_identity() {
        assert!(GIT_COMMIT_HASH == "unknown" || GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            APP_USER_AGENT,
            format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        );
    }
}
