//! Request admission for an API gateway.
//!
//! Identified callers are metered by a token bucket, anonymous callers by a
//! fixed window keyed on their network origin. All counter state lives in a
//! shared [`storage::CounterStore`] (Redis in production) and every update is
//! applied atomically by the store, so any number of gateway workers can
//! evaluate the same caller concurrently without over-admitting.

pub mod algorithms;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod storage;

use std::fmt;

pub use config::{FailurePolicy, FixedWindowConfig, LimitsConfig, Settings, TokenBucketConfig};
pub use engine::DecisionEngine;
pub use error::{RateLimitError, Result};

/// The subject a quota is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerKey {
    /// Verified principal, metered by the token bucket
    Identified(String),
    /// Network origin of an unauthenticated request, metered by the fixed window
    Anonymous(String),
}

impl CallerKey {
    /// A verified identity wins; anything else falls back to the origin.
    pub fn classify(identity: Option<String>, origin: impl Into<String>) -> Self {
        match identity {
            Some(identity) if !identity.is_empty() => CallerKey::Identified(identity),
            _ => CallerKey::Anonymous(origin.into()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CallerKey::Identified(_) => "identified",
            CallerKey::Anonymous(_) => "anonymous",
        }
    }
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerKey::Identified(identity) => write!(f, "user:{}", identity),
            CallerKey::Anonymous(origin) => write!(f, "ip:{}", origin),
        }
    }
}

/// Which algorithm produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    TokenBucket,
    FixedWindow,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::TokenBucket => "token_bucket",
            Strategy::FixedWindow => "fixed_window",
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    // whether the request is allowed
    pub admitted: bool,
    // quota ceiling reported to the client
    pub limit: u32,
    // requests left after this one
    pub remaining: u32,
    pub strategy: Strategy,
}

impl Decision {
    pub fn admitted(strategy: Strategy, limit: u32, remaining: u32) -> Self {
        Self {
            admitted: true,
            limit,
            remaining,
            strategy,
        }
    }

    pub fn rejected(strategy: Strategy, limit: u32, remaining: u32) -> Self {
        Self {
            admitted: false,
            limit,
            remaining,
            strategy,
        }
    }
}

//Core trait that both algorithms implement
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether `key` may issue one more request at `now` (unix seconds),
    /// consuming quota when it may.
    async fn evaluate(&self, key: &str, now: u64) -> Result<Decision>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verified_identity_wins() {
        let key = CallerKey::classify(Some("a@x.com".into()), "1.2.3.4");
        assert_eq!(key, CallerKey::Identified("a@x.com".into()));
        assert_eq!(key.kind(), "identified");
        assert_eq!(key.to_string(), "user:a@x.com");
    }

    #[test]
    fn missing_or_empty_identity_is_anonymous() {
        assert_eq!(
            CallerKey::classify(None, "1.2.3.4"),
            CallerKey::Anonymous("1.2.3.4".into())
        );
        let key = CallerKey::classify(Some(String::new()), "1.2.3.4");
        assert_eq!(key.to_string(), "ip:1.2.3.4");
    }
}
