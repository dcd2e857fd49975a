//! Rate limiting for credential-bearing endpoints.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleAction {
    Login,
    Token,
    MfaVerify,
    /// Re-sending a challenge; each call may send an SMS.
    MfaResend,
}

impl ThrottleAction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Token => "token",
            Self::MfaVerify => "mfa_verify",
            Self::MfaResend => "mfa_resend",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    Limited { retry_after_seconds: u64 },
}

pub trait RateLimiter: Send + Sync {
    /// Count one attempt for `key` and decide whether it may proceed.
    fn check(&self, action: ThrottleAction, key: &str) -> ThrottleDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _action: ThrottleAction, _key: &str) -> ThrottleDecision {
        ThrottleDecision::Allowed
    }
}

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counters keyed by `sha256(action | key)`.
pub struct WindowRateLimiter {
    window: Duration,
    max_attempts: u32,
    counters: Mutex<HashMap<Vec<u8>, Window>>,
}

impl std::fmt::Debug for WindowRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowRateLimiter")
            .field("window", &self.window)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl WindowRateLimiter {
    #[must_use]
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self {
            window: window.max(Duration::from_secs(1)),
            max_attempts: max_attempts.max(1),
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn counter_key(action: ThrottleAction, key: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(action.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.finalize().to_vec()
    }

    fn check_at(&self, action: ThrottleAction, key: &str, now: Instant) -> ThrottleDecision {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.window;
        counters.retain(|_, entry| now.duration_since(entry.started) < window);

        let entry = counters
            .entry(Self::counter_key(action, key))
            .or_insert(Window {
                started: now,
                count: 0,
            });
        entry.count = entry.count.saturating_add(1);
        if entry.count <= self.max_attempts {
            return ThrottleDecision::Allowed;
        }
        let remaining = window.saturating_sub(now.duration_since(entry.started));
        ThrottleDecision::Limited {
            retry_after_seconds: remaining.as_secs().max(1),
        }
    }
}

impl RateLimiter for WindowRateLimiter {
    fn check(&self, action: ThrottleAction, key: &str) -> ThrottleDecision {
        self.check_at(action, key, Instant::now())
    }
}
