//! Concurrent admissions for a single caller must never spend quota twice.

use futures::future::join_all;
use rate_gate::clock::ManualClock;
use rate_gate::storage::{CounterStore, MemoryStore, Swap};
use rate_gate::{CallerKey, DecisionEngine, LimitsConfig, Result, TokenBucketConfig};
use std::sync::Arc;
use std::time::Duration;

fn engine_over(store: &MemoryStore) -> Arc<DecisionEngine> {
    Arc::new(DecisionEngine::new(
        Arc::new(store.clone()),
        &LimitsConfig::default(),
        Duration::from_secs(5),
    ))
}

/// Memory store that yields to the scheduler before every read and swap,
/// the way a network round trip would. On a current-thread runtime every
/// task reads before any of them commits, so most swaps lose.
#[derive(Clone)]
struct RoundTripStore(MemoryStore);

#[async_trait::async_trait]
impl CounterStore for RoundTripStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        self.0.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<()> {
        tokio::task::yield_now().await;
        self.0.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, ttl: Option<u64>) -> Result<i64> {
        tokio::task::yield_now().await;
        self.0.increment(key, ttl).await
    }

    async fn compare_and_swap(&self, swaps: &[Swap], ttl: Option<u64>) -> Result<bool> {
        tokio::task::yield_now().await;
        self.0.compare_and_swap(swaps, ttl).await
    }
}

fn large_bucket() -> LimitsConfig {
    LimitsConfig {
        token_bucket: TokenBucketConfig {
            max_tokens: 40,
            state_ttl_secs: 240,
            ..TokenBucketConfig::default()
        },
        ..LimitsConfig::default()
    }
}

fn engine_with_round_trips(store: &MemoryStore, limits: &LimitsConfig) -> Arc<DecisionEngine> {
    Arc::new(DecisionEngine::new(
        Arc::new(RoundTripStore(store.clone())),
        limits,
        Duration::from_secs(5),
    ))
}

async fn fan_out(engine: Arc<DecisionEngine>, caller: CallerKey, requests: usize) -> usize {
    let handles = (0..requests).map(|_| {
        let engine = Arc::clone(&engine);
        let caller = caller.clone();
        tokio::spawn(async move { engine.admit(&caller, 0).await })
    });
    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("admission failed"))
        .filter(|decision| decision.admitted)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn fresh_bucket_admits_exactly_capacity() {
    let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
    let caller = CallerKey::Identified("race@x.com".to_string());

    let admitted = fan_out(engine_over(&store), caller, 15).await;

    assert_eq!(admitted, 10);
    assert_eq!(
        store.get("tokens:user:race@x.com").await.unwrap().as_deref(),
        Some("0")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn partially_spent_bucket_admits_what_is_left() {
    let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
    store.set("tokens:user:t@x.com", "4", None).await.unwrap();
    store.set("last_refill:user:t@x.com", "0", None).await.unwrap();
    let caller = CallerKey::Identified("t@x.com".to_string());

    let admitted = fan_out(engine_over(&store), caller, 9).await;

    assert_eq!(admitted, 4);
    assert_eq!(
        store.get("tokens:user:t@x.com").await.unwrap().as_deref(),
        Some("0")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn fewer_requests_than_tokens_are_all_admitted() {
    let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
    let caller = CallerKey::Identified("light@x.com".to_string());

    let admitted = fan_out(engine_over(&store), caller, 6).await;

    assert_eq!(admitted, 6);
    assert_eq!(
        store.get("tokens:user:light@x.com").await.unwrap().as_deref(),
        Some("4")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn anonymous_window_admits_exactly_limit() {
    let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
    let caller = CallerKey::Anonymous("203.0.113.7".to_string());

    let admitted = fan_out(engine_over(&store), caller, 20).await;

    assert_eq!(admitted, 5);
}

#[tokio::test]
async fn bucket_larger_than_swap_budget_admits_every_token() {
    let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
    let limits = large_bucket();
    assert!(limits.token_bucket.max_tokens > limits.max_cas_attempts);
    let caller = CallerKey::Identified("big@x.com".to_string());

    let admitted = fan_out(engine_with_round_trips(&store, &limits), caller, 40).await;

    assert_eq!(admitted, 40);
    assert_eq!(
        store.get("tokens:user:big@x.com").await.unwrap().as_deref(),
        Some("0")
    );
}

#[tokio::test]
async fn lost_races_retry_until_the_bucket_is_empty() {
    let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
    let caller = CallerKey::Identified("burst@x.com".to_string());

    let admitted = fan_out(
        engine_with_round_trips(&store, &large_bucket()),
        caller,
        60,
    )
    .await;

    assert_eq!(admitted, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn round_trips_on_many_threads_admit_exactly_capacity() {
    let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
    let caller = CallerKey::Identified("mt@x.com".to_string());

    let admitted = fan_out(
        engine_with_round_trips(&store, &LimitsConfig::default()),
        caller,
        30,
    )
    .await;

    assert_eq!(admitted, 10);
}
