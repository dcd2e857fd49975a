use clap::{Arg, ArgMatches, Command};

pub const ARG_WEBHOOK_URL: &str = "notify-webhook-url";
pub const ARG_MAX_ATTEMPTS: &str = "notify-max-attempts";
pub const ARG_BACKOFF_BASE: &str = "notify-backoff-base-seconds";
pub const ARG_BACKOFF_MAX: &str = "notify-backoff-max-seconds";

#[derive(Debug)]
pub struct Options {
    pub webhook_url: Option<String>,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Options {
    /// Parse notification delivery arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the webhook URL is not a valid http(s) URL.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let webhook_url = matches
            .get_one::<String>(ARG_WEBHOOK_URL)
            .cloned()
            .filter(|v| !v.trim().is_empty());
        if let Some(url) = &webhook_url {
            let parsed = url::Url::parse(url)
                .map_err(|err| anyhow::anyhow!("invalid --{ARG_WEBHOOK_URL}: {err}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("invalid --{ARG_WEBHOOK_URL}: scheme must be http or https");
            }
        }

        Ok(Self {
            webhook_url,
            max_attempts: matches.get_one::<u32>(ARG_MAX_ATTEMPTS).copied().unwrap_or(5),
            backoff_base_seconds: matches.get_one::<u64>(ARG_BACKOFF_BASE).copied().unwrap_or(2),
            backoff_max_seconds: matches.get_one::<u64>(ARG_BACKOFF_MAX).copied().unwrap_or(60),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_WEBHOOK_URL)
                .long(ARG_WEBHOOK_URL)
                .help("Deliver one-time codes by POSTing JSON to this URL (default: log them)")
                .env("SSO_NOTIFY_WEBHOOK_URL"),
        )
        .arg(
            Arg::new(ARG_MAX_ATTEMPTS)
                .long(ARG_MAX_ATTEMPTS)
                .help("Max delivery attempts per message")
                .env("SSO_NOTIFY_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_BACKOFF_BASE)
                .long(ARG_BACKOFF_BASE)
                .help("Base delay for delivery retry backoff")
                .env("SSO_NOTIFY_BACKOFF_BASE_SECONDS")
                .default_value("2")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_BACKOFF_MAX)
                .long(ARG_BACKOFF_MAX)
                .help("Max delay for delivery retry backoff")
                .env("SSO_NOTIFY_BACKOFF_MAX_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
}
