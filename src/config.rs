//! Gateway configuration.
//!
//! Loaded from `config/default.toml`, then `config/local.toml`, then
//! `RATE_GATE__*` environment variables (`__` separates sections, e.g.
//! `RATE_GATE__STORE__REDIS_URL`). Every section has defaults, so an empty
//! environment yields a gateway backed by Redis on localhost.

use crate::{RateLimitError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Token bucket parameters for identified callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenBucketConfig {
    /// Bucket capacity, also the reported limit
    pub max_tokens: u32,
    /// Seconds per refill step
    pub refill_interval_secs: u64,
    /// Tokens credited per elapsed interval
    pub refill_rate: u32,
    /// Expiry of the bucket keys after the last write
    pub state_ttl_secs: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            refill_interval_secs: 6,
            refill_rate: 1,
            state_ttl_secs: 120,
        }
    }
}

impl TokenBucketConfig {
    /// Seconds an empty bucket needs to refill completely.
    pub fn refill_horizon_secs(&self) -> u64 {
        let steps = (self.max_tokens as u64).div_ceil(self.refill_rate.max(1) as u64);
        steps * self.refill_interval_secs
    }
}

/// Fixed window parameters for anonymous origins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FixedWindowConfig {
    pub limit: u32,
    pub window_secs: u64,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub token_bucket: TokenBucketConfig,
    pub fixed_window: FixedWindowConfig,
    /// Lost bucket updates in a row, with no competing commit visible, before
    /// giving up with a contention error
    pub max_cas_attempts: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            token_bucket: TokenBucketConfig::default(),
            fixed_window: FixedWindowConfig::default(),
            max_cas_attempts: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Upper bound for a single store round trip
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            timeout_ms: 500,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What the middleware does when the limiter itself fails (store down,
/// timed out, or contention exhausted).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject with a server error
    #[default]
    FailClosed,
    /// Let the request through without quota headers
    FailOpen,
}

/// One accepted bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenEntry {
    pub token: String,
    pub identity: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    // a list rather than a table: config keys are case-folded, tokens aren't
    pub tokens: Vec<TokenEntry>,
}

impl IdentityConfig {
    /// Token -> identity lookup table.
    pub fn token_table(&self) -> HashMap<String, String> {
        self.tokens
            .iter()
            .map(|entry| (entry.token.clone(), entry.identity.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Take the origin from the first X-Forwarded-For hop instead of the peer address
    pub trust_forwarded_for: bool,
    /// Browser origins allowed to call the gateway and read the quota headers.
    /// A single `"*"` allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            trust_forwarded_for: false,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub limits: LimitsConfig,
    pub failure_policy: FailurePolicy,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("RATE_GATE").separator("__"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let bucket = &self.limits.token_bucket;
        if bucket.max_tokens == 0 || bucket.refill_rate == 0 || bucket.refill_interval_secs == 0 {
            return Err(RateLimitError::ConfigError(
                "token bucket max_tokens, refill_rate and refill_interval_secs must be positive"
                    .to_string(),
            ));
        }
        // an idle bucket must not vanish before it could have refilled to full
        if bucket.state_ttl_secs < bucket.refill_horizon_secs() {
            return Err(RateLimitError::ConfigError(format!(
                "token bucket state_ttl_secs ({}) is shorter than the refill horizon ({}s)",
                bucket.state_ttl_secs,
                bucket.refill_horizon_secs()
            )));
        }
        let window = &self.limits.fixed_window;
        if window.limit == 0 || window.window_secs == 0 {
            return Err(RateLimitError::ConfigError(
                "fixed window limit and window_secs must be positive".to_string(),
            ));
        }
        if self.limits.max_cas_attempts == 0 {
            return Err(RateLimitError::ConfigError(
                "max_cas_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(RateLimitError::ConfigError(
                "store timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
