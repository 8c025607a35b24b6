pub mod memory;
pub mod redis_storage;
pub mod timed;

pub use memory::MemoryStore;
pub use redis_storage::RedisStore;
pub use timed::TimedStore;

use crate::Result;

/// Key holding the fractional token count of an identified caller.
pub fn tokens_key(identity: &str) -> String {
    format!("tokens:user:{}", identity)
}

/// Key holding the unix-seconds refill anchor of an identified caller.
pub fn last_refill_key(identity: &str) -> String {
    format!("last_refill:user:{}", identity)
}

/// Key holding the request count of an anonymous origin's current window.
pub fn window_key(origin: &str) -> String {
    format!("ratelimit:ip:{}", origin)
}

/// One key of a compare-and-swap batch.
///
/// `expected: None` means the key must be absent for the swap to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swap {
    pub key: String,
    pub expected: Option<String>,
    pub new: String,
}

impl Swap {
    pub fn new(key: impl Into<String>, expected: Option<String>, new: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expected,
            new: new.into(),
        }
    }
}

// Shared counter store contract.
// Every call is its own round trip; no transaction spans two calls. The only
// multi-key atomicity available is what `compare_and_swap` provides.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    // Get the raw value for a key, None if it doesn't exist (or expired)
    async fn get(&self, key: &str) -> Result<Option<String>>;

    // Overwrite a key, optionally with an expiry in seconds
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Atomically increment an integer key and return the new value.
    ///
    /// A missing key counts as 0. When this increment creates the key and
    /// `ttl_on_create` is set, the expiry is applied in the same atomic step;
    /// increments of an existing key never touch its TTL.
    async fn increment(&self, key: &str, ttl_on_create: Option<u64>) -> Result<i64>;

    /// Atomically write every `new` value if, and only if, every key currently
    /// holds its `expected` value. Returns `false` without writing anything
    /// when any key differs.
    async fn compare_and_swap(&self, swaps: &[Swap], ttl_secs: Option<u64>) -> Result<bool>;
}
