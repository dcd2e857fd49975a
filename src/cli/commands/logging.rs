//! `-v` flags or `SSO_LOG_LEVEL`, and the tracing level they select.

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";

/// Quietest first; a name's position is the `-v` count it stands for.
const LEVEL_NAMES: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

fn parse_level(value: &str) -> Result<u8, String> {
    let value = value.trim();
    let position = LEVEL_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value));
    let count = match position {
        Some(index) => u8::try_from(index).ok(),
        None => value
            .parse::<u8>()
            .ok()
            .filter(|count| usize::from(*count) < LEVEL_NAMES.len()),
    };
    count.ok_or_else(|| {
        format!(
            "invalid log level {value:?}, expected one of {}",
            LEVEL_NAMES.join(", ")
        )
    })
}

/// `None` keeps the subscriber default (errors only).
#[must_use]
pub fn level(matches: &ArgMatches) -> Option<Level> {
    match matches.get_one::<u8>(ARG_VERBOSITY).copied().unwrap_or(0) {
        0 => None,
        1 => Some(Level::WARN),
        2 => Some(Level::INFO),
        3 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Repeat to log more: -v warn, -vv info, -vvv debug, -vvvv trace")
            .env("SSO_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(parse_level),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_counts_parse() {
        assert_eq!(parse_level("error"), Ok(0));
        assert_eq!(parse_level(" DEBUG "), Ok(3));
        assert_eq!(parse_level("4"), Ok(4));
        assert!(parse_level("5").is_err());
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn flag_count_selects_level() {
        temp_env::with_vars([("SSO_LOG_LEVEL", None::<&str>)], || {
            let level_for = |args: &[&str]| level(&with_args(Command::new("sso")).get_matches_from(args));
            assert_eq!(level_for(&["sso"]), None);
            assert_eq!(level_for(&["sso", "-v"]), Some(Level::WARN));
            assert_eq!(level_for(&["sso", "-vv"]), Some(Level::INFO));
            assert_eq!(level_for(&["sso", "-vvv"]), Some(Level::DEBUG));
            assert_eq!(level_for(&["sso", "-vvvvvv"]), Some(Level::TRACE));
        });
    }
}
