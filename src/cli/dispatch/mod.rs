//! Map validated CLI arguments to the action to run.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{auth, notify};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth = auth::Options::parse(matches)?;
    let notify = notify::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        auth,
        notify,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::MfaPolicy;
    use secrecy::ExposeSecret;

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    #[test]
    fn server_action_carries_options() {
        temp_env::with_vars(
            [
                ("SSO_DSN", Some("postgres://user@localhost:5432/sso")),
                ("SSO_SIGNING_KEY", Some(KEY)),
                ("SSO_MFA_POLICY", Some("all")),
                ("SSO_NOTIFY_WEBHOOK_URL", None),
                ("SSO_PRUNE_INTERVAL_SECONDS", Some("45")),
                ("SSO_USERINFO_CLIENTS", Some("spa, web")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["sso"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert_eq!(args.dsn, "postgres://user@localhost:5432/sso");
                    assert_eq!(args.auth.signing_key.expose_secret(), KEY);
                    assert_eq!(args.auth.mfa_policy, MfaPolicy::All);
                    assert!(args.notify.webhook_url.is_none());
                    assert_eq!(args.auth.prune_interval_seconds, 45);
                    assert_eq!(args.auth.userinfo_clients, vec!["spa", "web"]);
                }
            },
        );
    }

    #[test]
    fn blank_signing_key_is_rejected() {
        temp_env::with_vars(
            [
                ("SSO_DSN", Some("postgres://user@localhost:5432/sso")),
                ("SSO_SIGNING_KEY", Some("  ")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["sso"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(
                        err.to_string()
                            .contains("missing required argument: --signing-key")
                    );
                }
            },
        );
    }

    #[test]
    fn webhook_must_be_http() {
        temp_env::with_vars(
            [
                ("SSO_DSN", Some("postgres://user@localhost:5432/sso")),
                ("SSO_SIGNING_KEY", Some(KEY)),
                ("SSO_NOTIFY_WEBHOOK_URL", Some("ftp://hooks.example.com")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["sso"]);
                assert!(handler(&matches).is_err());
            },
        );
    }
}
