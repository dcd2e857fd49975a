//! Request-time guard pipeline for bearer-protected endpoints.

use std::collections::BTreeSet;

use super::{client::Client, error::OAuthError, scope::ScopeSet, token::BearerRecord};

/// What a guard gets to look at.
#[derive(Debug)]
pub struct GuardContext<'a> {
    pub client: Option<&'a Client>,
    pub grant: &'a BearerRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Pass,
    Fail(String),
}

pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, context: &GuardContext<'_>) -> GuardOutcome;
}

/// The token's client must still exist and be active.
#[derive(Debug, Default)]
pub struct ClientActive;

impl Guard for ClientActive {
    fn name(&self) -> &'static str {
        "client_active"
    }

    fn check(&self, context: &GuardContext<'_>) -> GuardOutcome {
        match context.client {
            Some(client) if client.is_active => GuardOutcome::Pass,
            Some(_) => GuardOutcome::Fail("client is inactive".to_string()),
            None => GuardOutcome::Fail("client not found".to_string()),
        }
    }
}

#[derive(Debug)]
pub struct RequireScopes {
    required: ScopeSet,
}

impl RequireScopes {
    #[must_use]
    pub fn new(required: ScopeSet) -> Self {
        Self { required }
    }
}

impl Guard for RequireScopes {
    fn name(&self) -> &'static str {
        "require_scopes"
    }

    fn check(&self, context: &GuardContext<'_>) -> GuardOutcome {
        if self.required.is_subset(&context.grant.scopes) {
            GuardOutcome::Pass
        } else {
            GuardOutcome::Fail(format!(
                "required scopes not granted: {}",
                self.required.missing_from(&context.grant.scopes).join(" ")
            ))
        }
    }
}

#[derive(Debug)]
pub struct ClientAllowList {
    allowed: BTreeSet<String>,
}

impl ClientAllowList {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl Guard for ClientAllowList {
    fn name(&self) -> &'static str {
        "client_allow_list"
    }

    fn check(&self, context: &GuardContext<'_>) -> GuardOutcome {
        if self.allowed.contains(&context.grant.client_id) {
            GuardOutcome::Pass
        } else {
            GuardOutcome::Fail("client_id not allowed".to_string())
        }
    }
}

/// Ordered guards; the first failure wins.
#[derive(Default)]
pub struct GuardChain {
    guards: Vec<Box<dyn Guard>>,
}

impl std::fmt::Debug for GuardChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.guards.iter().map(|guard| guard.name()))
            .finish()
    }
}

impl GuardChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, guard: impl Guard + 'static) -> Self {
        self.guards.push(Box::new(guard));
        self
    }

    /// # Errors
    /// `not_authorized` carrying the failing guard's reason.
    pub fn evaluate(&self, context: &GuardContext<'_>) -> Result<(), OAuthError> {
        for guard in &self.guards {
            if let GuardOutcome::Fail(reason) = guard.check(context) {
                tracing::debug!(guard = guard.name(), %reason, "guard rejected request");
                return Err(OAuthError::NotAuthorized(reason));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth2::client::ClientType;
    use anyhow::Result;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn grant(scopes: &str) -> Result<BearerRecord> {
        Ok(BearerRecord {
            token_hash: vec![0; 32],
            client_id: "web".to_string(),
            user_id: Uuid::new_v4(),
            scopes: ScopeSet::parse(scopes)?,
            device_id: None,
            family_id: Uuid::new_v4(),
            auth_time: Utc::now(),
            created_at: Utc::now(),
        })
    }

    #[test]
    fn proper_subset_is_rejected_superset_accepted() -> Result<()> {
        let chain = GuardChain::new().with(RequireScopes::new(ScopeSet::parse("openid email")?));
        let narrow = grant("openid")?;
        let context = GuardContext { client: None, grant: &narrow };
        assert!(matches!(
            chain.evaluate(&context),
            Err(OAuthError::NotAuthorized(reason)) if reason.contains("email")
        ));

        let wide = grant("openid email profile")?;
        let context = GuardContext { client: None, grant: &wide };
        assert!(chain.evaluate(&context).is_ok());
        Ok(())
    }

    #[test]
    fn inactive_client_fails() -> Result<()> {
        let client = Client::new("web", "Web", ClientType::Native).with_active(false);
        let grant = grant("openid")?;
        let chain = GuardChain::new().with(ClientActive);
        let context = GuardContext { client: Some(&client), grant: &grant };
        assert!(chain.evaluate(&context).is_err());
        let context = GuardContext { client: None, grant: &grant };
        assert!(chain.evaluate(&context).is_err());
        Ok(())
    }

    #[test]
    fn allow_list() -> Result<()> {
        let grant = grant("openid")?;
        let context = GuardContext { client: None, grant: &grant };
        assert!(GuardChain::new().with(ClientAllowList::new(["web"])).evaluate(&context).is_ok());
        assert!(GuardChain::new().with(ClientAllowList::new(["api"])).evaluate(&context).is_err());
        Ok(())
    }

    struct Counting(Arc<AtomicUsize>);

    impl Guard for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn check(&self, _context: &GuardContext<'_>) -> GuardOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            GuardOutcome::Pass
        }
    }

    #[test]
    fn chain_short_circuits() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = GuardChain::new()
            .with(ClientAllowList::new(["api"]))
            .with(Counting(calls.clone()));
        let grant = grant("openid")?;
        let context = GuardContext { client: None, grant: &grant };
        assert!(chain.evaluate(&context).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
