//! Dispatch from a classified caller to the algorithm that meters it.

use crate::algorithms::{FixedWindowLimiter, TokenBucketLimiter};
use crate::config::{LimitsConfig, Settings};
use crate::storage::{CounterStore, TimedStore};
use crate::{CallerKey, Decision, RateLimiter, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Stateless admission engine.
///
/// Holds no counters of its own: every call re-reads and re-writes through
/// the injected store, so one engine behind an `Arc` serves every worker.
pub struct DecisionEngine {
    token_bucket: TokenBucketLimiter,
    fixed_window: FixedWindowLimiter,
}

impl DecisionEngine {
    /// Build an engine whose store round trips are each bounded by `store_timeout`.
    pub fn new(store: Arc<dyn CounterStore>, limits: &LimitsConfig, store_timeout: Duration) -> Self {
        let store: Arc<dyn CounterStore> = Arc::new(TimedStore::new(store, store_timeout));
        Self {
            token_bucket: TokenBucketLimiter::new(
                limits.token_bucket.clone(),
                Arc::clone(&store),
                limits.max_cas_attempts,
            ),
            fixed_window: FixedWindowLimiter::new(limits.fixed_window.clone(), store),
        }
    }

    pub fn from_settings(store: Arc<dyn CounterStore>, settings: &Settings) -> Self {
        Self::new(store, &settings.limits, settings.store.timeout())
    }

    /// Decide one request for `caller` at `now` (unix seconds).
    pub async fn admit(&self, caller: &CallerKey, now: u64) -> Result<Decision> {
        let decision = match caller {
            CallerKey::Identified(identity) => self.token_bucket.evaluate(identity, now).await?,
            CallerKey::Anonymous(origin) => self.fixed_window.evaluate(origin, now).await?,
        };
        debug!(
            caller = %caller,
            strategy = decision.strategy.as_str(),
            admitted = decision.admitted,
            remaining = decision.remaining,
            "admission evaluated"
        );
        Ok(decision)
    }

    /// The limit reported for `caller`, known without touching the store.
    pub fn limit_for(&self, caller: &CallerKey) -> u32 {
        match caller {
            CallerKey::Identified(_) => self.token_bucket.config.max_tokens,
            CallerKey::Anonymous(_) => self.fixed_window.config.limit,
        }
    }
}
