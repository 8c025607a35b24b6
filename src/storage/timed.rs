use super::{CounterStore, Swap};
use crate::{RateLimitError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Bounds every round trip of the wrapped store.
///
/// A call that outlives `limit` is abandoned and reported as
/// `StoreUnavailable`. Nothing is rolled back: each write is a single atomic
/// store command, so it either landed or it didn't, and the next evaluation
/// recomputes from a fresh read.
pub struct TimedStore {
    inner: Arc<dyn CounterStore>,
    limit: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn CounterStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::StoreUnavailable(format!(
                "{} timed out after {:?}",
                op, self.limit
            ))),
        }
    }
}

#[async_trait::async_trait]
impl CounterStore for TimedStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.bounded("GET", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        self.bounded("SET", self.inner.set(key, value, ttl_secs)).await
    }

    async fn increment(&self, key: &str, ttl_on_create: Option<u64>) -> Result<i64> {
        self.bounded("INCR", self.inner.increment(key, ttl_on_create))
            .await
    }

    async fn compare_and_swap(&self, swaps: &[Swap], ttl_secs: Option<u64>) -> Result<bool> {
        self.bounded("CAS", self.inner.compare_and_swap(swaps, ttl_secs))
            .await
    }
}
