use crate::config::TokenBucketConfig;
use crate::storage::{last_refill_key, tokens_key, CounterStore, Swap};
use crate::{Decision, RateLimitError, RateLimiter, Result, Strategy};
use std::sync::Arc;
use tracing::{debug, warn};

/// Persisted state of one caller's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Current number of tokens, fractional so refills never round away
    pub tokens: f64,
    /// Unix seconds up to which refill has been credited
    pub last_refill: u64,
}

impl BucketState {
    /// A bucket seen for the first time starts full.
    pub fn full(config: &TokenBucketConfig, now: u64) -> Self {
        Self {
            tokens: config.max_tokens as f64,
            last_refill: now,
        }
    }

    /// Credit every whole refill interval elapsed since `last_refill`.
    ///
    /// The anchor advances by exactly the intervals credited, so progress
    /// through a partial interval carries over to the next evaluation. A
    /// bucket that hits capacity re-anchors at `now`.
    pub fn refill(&mut self, now: u64, config: &TokenBucketConfig) {
        if self.last_refill > now {
            self.last_refill = now;
        }
        let intervals = (now - self.last_refill) / config.refill_interval_secs;
        if intervals == 0 {
            return;
        }
        let max = config.max_tokens as f64;
        let credited = self.tokens + intervals as f64 * config.refill_rate as f64;
        if credited >= max {
            self.tokens = max;
            self.last_refill = now;
        } else {
            self.tokens = credited;
            self.last_refill += intervals * config.refill_interval_secs;
        }
    }

    pub fn remaining(&self) -> u32 {
        self.tokens.floor().max(0.0) as u32
    }
}

/// Token bucket limiter for identified callers.
///
/// Reads `tokens:user:<id>` and `last_refill:user:<id>`, computes the new
/// state locally, then writes both keys back with one store-side
/// compare-and-swap conditioned on the values it read. A lost race re-reads
/// and recomputes, so concurrent requests for one caller never spend the
/// same token twice.
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    pub config: TokenBucketConfig,
    max_attempts: u32,
}

impl TokenBucketLimiter {
    pub fn new(config: TokenBucketConfig, store: Arc<dyn CounterStore>, max_attempts: u32) -> Self {
        Self {
            store,
            config,
            max_attempts: max_attempts.max(1),
        }
    }

    fn limit(&self) -> u32 {
        self.config.max_tokens
    }

    /// Parse the raw pair read from the store.
    ///
    /// `Ok(None)` when the bucket doesn't exist yet; a value that doesn't
    /// parse, or a token count outside `0..=max_tokens`, is `InvalidState`.
    fn parse_state(
        &self,
        identity: &str,
        tokens: Option<&str>,
        last_refill: Option<&str>,
    ) -> Result<Option<BucketState>> {
        let (Some(tokens), Some(last_refill)) = (tokens, last_refill) else {
            return Ok(None);
        };
        let max = self.config.max_tokens as f64;
        let parsed_tokens = tokens
            .parse::<f64>()
            .ok()
            .filter(|t| t.is_finite() && (0.0..=max).contains(t))
            .ok_or_else(|| RateLimitError::InvalidState {
                key: tokens_key(identity),
                value: tokens.to_string(),
            })?;
        let parsed_refill = last_refill
            .parse::<u64>()
            .map_err(|_| RateLimitError::InvalidState {
                key: last_refill_key(identity),
                value: last_refill.to_string(),
            })?;
        Ok(Some(BucketState {
            tokens: parsed_tokens,
            last_refill: parsed_refill,
        }))
    }
}

#[async_trait::async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn evaluate(&self, identity: &str, now: u64) -> Result<Decision> {
        let tokens_key = tokens_key(identity);
        let refill_key = last_refill_key(identity);

        // Only lost races that show no competing commit count against the
        // budget. Any other loss means another request spent a token, so the
        // loop ends once the bucket reads empty.
        let mut attempts = 0u32;
        let mut last_seen: Option<(Option<String>, Option<String>)> = None;
        loop {
            let raw_tokens = self.store.get(&tokens_key).await?;
            let raw_refill = self.store.get(&refill_key).await?;
            let seen = (raw_tokens.clone(), raw_refill.clone());
            if last_seen.as_ref() == Some(&seen) {
                attempts += 1;
            } else {
                attempts = 1;
            }
            if attempts > self.max_attempts {
                return Err(RateLimitError::Contention {
                    key: tokens_key,
                    attempts: self.max_attempts,
                });
            }

            let mut state =
                match self.parse_state(identity, raw_tokens.as_deref(), raw_refill.as_deref()) {
                    Ok(Some(state)) => state,
                    Ok(None) => BucketState::full(&self.config, now),
                    Err(e) => {
                        warn!(identity, error = %e, "corrupt token bucket state, starting a full bucket");
                        BucketState::full(&self.config, now)
                    }
                };
            state.refill(now, &self.config);

            if state.tokens < 1.0 {
                debug!(identity, tokens = state.tokens, "token bucket empty");
                return Ok(Decision::rejected(
                    Strategy::TokenBucket,
                    self.limit(),
                    state.remaining(),
                ));
            }

            state.tokens -= 1.0;
            let swaps = [
                Swap::new(tokens_key.clone(), raw_tokens, state.tokens.to_string()),
                Swap::new(refill_key.clone(), raw_refill, state.last_refill.to_string()),
            ];
            if self
                .store
                .compare_and_swap(&swaps, Some(self.config.state_ttl_secs))
                .await?
            {
                debug!(identity, remaining = state.remaining(), "token consumed");
                return Ok(Decision::admitted(
                    Strategy::TokenBucket,
                    self.limit(),
                    state.remaining(),
                ));
            }
            debug!(identity, attempts, "token bucket changed underneath us, retrying");
            last_seen = Some(seen);
        }
    }
}
