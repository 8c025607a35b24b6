//! Admission middleware driven through an axum router.

use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{
        header::{ACCESS_CONTROL_EXPOSE_HEADERS, AUTHORIZATION, ORIGIN},
        Request, StatusCode,
    },
    middleware,
    routing::get,
    Router,
};
use rate_gate::clock::ManualClock;
use rate_gate::identity::{BearerIdentity, StaticTokenVerifier};
use rate_gate::middleware::{admission_middleware, cors_layer, AdmissionState};
use rate_gate::storage::{CounterStore, MemoryStore, Swap};
use rate_gate::{DecisionEngine, FailurePolicy, LimitsConfig, RateLimitError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct DownStore;

#[async_trait::async_trait]
impl CounterStore for DownStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(RateLimitError::StoreUnavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<u64>) -> Result<()> {
        Err(RateLimitError::StoreUnavailable("connection refused".into()))
    }

    async fn increment(&self, _key: &str, _ttl: Option<u64>) -> Result<i64> {
        Err(RateLimitError::StoreUnavailable("connection refused".into()))
    }

    async fn compare_and_swap(&self, _swaps: &[Swap], _ttl: Option<u64>) -> Result<bool> {
        Err(RateLimitError::StoreUnavailable("connection refused".into()))
    }
}

/// Reads succeed, every bucket update loses its race.
struct StaleStore(MemoryStore);

#[async_trait::async_trait]
impl CounterStore for StaleStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.0.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<()> {
        self.0.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, ttl: Option<u64>) -> Result<i64> {
        self.0.increment(key, ttl).await
    }

    async fn compare_and_swap(&self, _swaps: &[Swap], _ttl: Option<u64>) -> Result<bool> {
        Ok(false)
    }
}

fn stale_store() -> Arc<dyn CounterStore> {
    Arc::new(StaleStore(MemoryStore::with_clock(Arc::new(ManualClock::new(0)))))
}

fn app_with(store: Arc<dyn CounterStore>, policy: FailurePolicy) -> Router {
    let engine = Arc::new(DecisionEngine::new(
        store,
        &LimitsConfig::default(),
        Duration::from_secs(1),
    ));
    let tokens = HashMap::from([("good-token".to_string(), "a@x.com".to_string())]);
    let resolver = Arc::new(BearerIdentity::new(StaticTokenVerifier::new(tokens)));
    let state = AdmissionState::new(engine, resolver)
        .with_clock(Arc::new(ManualClock::new(0)))
        .with_failure_policy(policy);

    Router::new()
        .route("/", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(state, admission_middleware))
}

fn app() -> Router {
    let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
    app_with(Arc::new(store), FailurePolicy::FailClosed)
}

fn request(peer: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri("/");
    if let Some(token) = bearer {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    let mut request = builder.body(Body::empty()).unwrap();
    let addr: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

fn header(response: &axum::response::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .map(|value| value.to_str().unwrap().to_string())
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn admitted_response_carries_quota_headers() {
    let response = app()
        .oneshot(request("1.2.3.4:1000", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("5"));
    assert_eq!(header(&response, "x-ratelimit-remaining").as_deref(), Some("4"));
}

#[tokio::test]
async fn sixth_anonymous_request_is_rejected_with_headers() {
    let app = app();
    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(request("1.2.3.4:1000", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(request("1.2.3.4:1000", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("5"));
    assert_eq!(header(&response, "x-ratelimit-remaining").as_deref(), Some("0"));

    let body = json_body(response).await;
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(body["limit"], 5);
    assert_eq!(body["remaining"], 0);
}

#[tokio::test]
async fn verified_token_uses_the_token_bucket() {
    let response = app()
        .oneshot(request("1.2.3.4:1000", Some("good-token")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("10"));
    assert_eq!(header(&response, "x-ratelimit-remaining").as_deref(), Some("9"));
}

#[tokio::test]
async fn bad_token_degrades_to_anonymous() {
    let response = app()
        .oneshot(request("1.2.3.4:1000", Some("forged")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("5"));
}

#[tokio::test]
async fn anonymous_origins_are_metered_separately() {
    let app = app();
    for _ in 0..5 {
        app.clone()
            .oneshot(request("1.2.3.4:1000", None))
            .await
            .unwrap();
    }
    let response = app
        .oneshot(request("5.6.7.8:1000", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining").as_deref(), Some("4"));
}

#[tokio::test]
async fn store_outage_fails_closed_by_default() {
    let response = app_with(Arc::new(DownStore), FailurePolicy::FailClosed)
        .oneshot(request("1.2.3.4:1000", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("5"));
    let body = json_body(response).await;
    assert_eq!(body["error"], "store_unavailable");
}

#[tokio::test]
async fn store_outage_can_fail_open() {
    let response = app_with(Arc::new(DownStore), FailurePolicy::FailOpen)
        .oneshot(request("1.2.3.4:1000", Some("good-token")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "x-ratelimit-remaining").is_none());
}

#[tokio::test]
async fn bucket_contention_fails_closed() {
    let response = app_with(stale_store(), FailurePolicy::FailClosed)
        .oneshot(request("1.2.3.4:1000", Some("good-token")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("10"));
    let body = json_body(response).await;
    assert_eq!(body["error"], "store_contention");
    assert_eq!(body["message"], "Server Error");
}

#[tokio::test]
async fn bucket_contention_can_fail_open() {
    let response = app_with(stale_store(), FailurePolicy::FailOpen)
        .oneshot(request("1.2.3.4:1000", Some("good-token")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "x-ratelimit-limit").is_none());
}

fn browser_app() -> Router {
    app().layer(cors_layer(&["http://localhost:3000".to_string()]))
}

fn browser_request(peer: &str) -> Request<Body> {
    let mut request = request(peer, None);
    request
        .headers_mut()
        .insert(ORIGIN, "http://localhost:3000".parse().unwrap());
    request
}

fn exposed_headers(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(ACCESS_CONTROL_EXPOSE_HEADERS)
        .map(|value| value.to_str().unwrap().to_ascii_lowercase())
        .unwrap_or_default()
}

#[tokio::test]
async fn cross_origin_callers_can_read_quota_headers() {
    let response = browser_app()
        .oneshot(browser_request("1.2.3.4:1000"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header(&response, "access-control-allow-origin").as_deref(),
        Some("http://localhost:3000")
    );
    let exposed = exposed_headers(&response);
    assert!(exposed.contains("x-ratelimit-limit"), "exposed: {exposed}");
    assert!(exposed.contains("x-ratelimit-remaining"), "exposed: {exposed}");
}

#[tokio::test]
async fn rejections_expose_quota_headers_too() {
    let app = browser_app();
    for _ in 0..5 {
        app.clone()
            .oneshot(browser_request("1.2.3.4:1000"))
            .await
            .unwrap();
    }
    let response = app
        .oneshot(browser_request("1.2.3.4:1000"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(exposed_headers(&response).contains("x-ratelimit-remaining"));
}
