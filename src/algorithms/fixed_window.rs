use crate::config::FixedWindowConfig;
use crate::storage::{window_key, CounterStore};
use crate::{Decision, RateLimitError, RateLimiter, Result, Strategy};
use std::sync::Arc;
use tracing::{debug, warn};

/// Fixed window counter for anonymous origins.
///
/// The window starts with the first request from an origin and ends when the
/// store expires `ratelimit:ip:<origin>`; there is no other reset. The
/// request that creates the key sets the window TTL in the same atomic step
/// as the increment, and later increments leave the TTL alone.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    pub config: FixedWindowConfig,
}

impl FixedWindowLimiter {
    pub fn new(config: FixedWindowConfig, store: Arc<dyn CounterStore>) -> Self {
        Self { store, config }
    }

    fn limit(&self) -> u32 {
        self.config.limit
    }

    /// Replace an unreadable counter with a fresh window holding this request.
    async fn restart_window(&self, key: &str, bad_value: &str) -> Result<Decision> {
        let err = RateLimitError::InvalidState {
            key: key.to_string(),
            value: bad_value.to_string(),
        };
        warn!(error = %err, "corrupt window counter, starting a fresh window");
        self.store
            .set(key, "1", Some(self.config.window_secs))
            .await?;
        Ok(Decision::admitted(
            Strategy::FixedWindow,
            self.limit(),
            self.limit().saturating_sub(1),
        ))
    }
}

#[async_trait::async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn evaluate(&self, origin: &str, now: u64) -> Result<Decision> {
        let key = window_key(origin);
        let limit = self.limit() as i64;

        let count = match self.store.get(&key).await? {
            None => 0,
            Some(raw) => match raw.parse::<i64>() {
                Ok(count) if count >= 0 => count,
                _ => return self.restart_window(&key, &raw).await,
            },
        };

        if count >= limit {
            debug!(origin, count, now, "fixed window exhausted");
            return Ok(Decision::rejected(Strategy::FixedWindow, self.limit(), 0));
        }

        let after = match self
            .store
            .increment(&key, Some(self.config.window_secs))
            .await
        {
            Ok(after) => after,
            Err(RateLimitError::InvalidState { value, .. }) => {
                return self.restart_window(&key, &value).await
            }
            Err(e) => return Err(e),
        };

        // another request took the last slot between our read and increment
        if after > limit {
            debug!(origin, count = after, now, "fixed window filled concurrently");
            return Ok(Decision::rejected(Strategy::FixedWindow, self.limit(), 0));
        }

        let remaining = (limit - after) as u32;
        debug!(origin, count = after, remaining, now, "fixed window slot taken");
        Ok(Decision::admitted(
            Strategy::FixedWindow,
            self.limit(),
            remaining,
        ))
    }
}
