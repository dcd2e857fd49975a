//! Space-delimited scope sets (RFC 6749 §3.3).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// `scope-token = 1*( %x21 / %x23-5B / %x5D-7E )`
static SCOPE_TOKEN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[\x21\x23-\x5B\x5D-\x7E]+$").ok());

pub const OPENID: &str = "openid";
pub const DEFAULT_CLIENT_SCOPES: &str = "openid profile email";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeSet(BTreeSet<String>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed scope token: {0}")]
pub struct ScopeParseError(pub String);

impl ScopeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space-delimited scope string, rejecting tokens outside the
    /// RFC 6749 grammar.
    ///
    /// # Errors
    /// Returns an error naming the first malformed token.
    pub fn parse(value: &str) -> Result<Self, ScopeParseError> {
        let mut scopes = BTreeSet::new();
        for token in value.split_whitespace() {
            let valid = SCOPE_TOKEN
                .as_ref()
                .is_some_and(|regex| regex.is_match(token));
            if !valid {
                return Err(ScopeParseError(token.to_string()));
            }
            scopes.insert(token.to_string());
        }
        Ok(Self(scopes))
    }

    /// Parse without validation, dropping empty entries. Used for values that
    /// were validated before they were stored.
    #[must_use]
    pub fn from_stored(value: &str) -> Self {
        Self(value.split_whitespace().map(str::to_string).collect())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Scopes in `self` missing from `granted`.
    #[must_use]
    pub fn missing_from<'a>(&'a self, granted: &'a Self) -> Vec<&'a str> {
        self.0
            .difference(&granted.0)
            .map(String::as_str)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().map(String::as_str).collect::<Vec<_>>().join(" ");
        f.write_str(&joined)
    }
}

impl<'a> FromIterator<&'a str> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(str::to_string).collect())
    }
}

impl Serialize for ScopeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScopeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}
