use crate::clock::{Clock, SystemClock};
use crate::config::FailurePolicy;
use crate::identity::IdentityResolver;
use crate::{CallerKey, Decision, DecisionEngine, RateLimitError};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_ORIGIN: &str = "unknown";

/// Shared state for the admission middleware
#[derive(Clone)]
pub struct AdmissionState {
    pub engine: Arc<DecisionEngine>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub clock: Arc<dyn Clock>,
    pub failure_policy: FailurePolicy,
    pub trust_forwarded_for: bool,
}

impl AdmissionState {
    pub fn new(engine: Arc<DecisionEngine>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            engine,
            resolver,
            clock: Arc::new(SystemClock),
            failure_policy: FailurePolicy::default(),
            trust_forwarded_for: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Admission middleware.
///
/// Runs before the route handlers: one engine call per request, never
/// retried. Admitted and rejected responses both carry the quota headers.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let identity = state.resolver.resolve(request.headers()).await;
    let origin = extract_origin(&request, state.trust_forwarded_for);
    let caller = CallerKey::classify(identity, origin);
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match state.engine.admit(&caller, state.clock.now_secs()).await {
        Ok(decision) => {
            let outcome = if decision.admitted { "admitted" } else { "rejected" };
            audit(&method, &path, &caller, outcome, &decision);
            if decision.admitted {
                let mut response = next.run(request).await;
                insert_quota_headers(response.headers_mut(), &decision);
                response
            } else {
                rejection_response(&decision)
            }
        }
        Err(err) => {
            let limit = state.engine.limit_for(&caller);
            match state.failure_policy {
                FailurePolicy::FailOpen => {
                    warn!(caller = %caller, error = %err, "rate limiter failed, admitting without quota");
                    audit_failure(&method, &path, &caller, "fail_open", true, limit, &err);
                    next.run(request).await
                }
                FailurePolicy::FailClosed => {
                    error!(caller = %caller, error = %err, "rate limiter failed, rejecting");
                    audit_failure(&method, &path, &caller, "fail_closed", false, limit, &err);
                    failure_response(&err, limit)
                }
            }
        }
    }
}

fn audit(
    method: &Method,
    path: &str,
    caller: &CallerKey,
    outcome: &'static str,
    decision: &Decision,
) {
    info!(
        target: "audit",
        method = %method,
        path,
        caller = %caller,
        kind = caller.kind(),
        outcome,
        admitted = decision.admitted,
        limit = decision.limit,
        remaining = decision.remaining,
        "admission decision"
    );
}

fn audit_failure(
    method: &Method,
    path: &str,
    caller: &CallerKey,
    outcome: &'static str,
    admitted: bool,
    limit: u32,
    err: &RateLimitError,
) {
    info!(
        target: "audit",
        method = %method,
        path,
        caller = %caller,
        kind = caller.kind(),
        outcome,
        admitted,
        limit,
        reason = err.reason(),
        "admission decision"
    );
}

fn insert_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
}

fn rejection_response(decision: &Decision) -> Response<Body> {
    let body = json!({
        "error": "rate_limited",
        "message": "Too many requests",
        "limit": decision.limit,
        "remaining": decision.remaining,
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    insert_quota_headers(response.headers_mut(), decision);
    response
}

fn failure_response(err: &RateLimitError, limit: u32) -> Response<Body> {
    let body = json!({
        "error": err.reason(),
        "message": "Server Error",
    });
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
    response
        .headers_mut()
        .insert(LIMIT_HEADER, HeaderValue::from(limit));
    response
}

/// Network origin of the request: the first forwarded hop when the gateway
/// sits behind a trusted proxy, otherwise the peer address.
fn extract_origin(request: &Request<Body>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let hop = request
            .headers()
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = hop {
            return hop.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
}
