//! Caller identity resolution.
//!
//! A request either presents a bearer token that verifies to an identity, or
//! it is anonymous. Bad credentials are never an error at this layer: they
//! are logged and the request is metered as anonymous.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use std::collections::HashMap;
use tracing::warn;

#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    /// The verified identity behind a request, `None` for anonymous.
    async fn resolve(&self, headers: &HeaderMap) -> Option<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("token not recognised")]
    UnknownToken,
}

/// Turns a bearer token into a stable identity (for example an email).
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, VerifyError>;
}

/// Verifier backed by a fixed token table, e.g. from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait::async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String, VerifyError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(VerifyError::UnknownToken)
    }
}

/// Resolves `Authorization: Bearer <token>` through a [`TokenVerifier`].
#[derive(Debug, Clone)]
pub struct BearerIdentity<V> {
    verifier: V,
}

impl<V> BearerIdentity<V> {
    pub fn new(verifier: V) -> Self {
        Self { verifier }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[async_trait::async_trait]
impl<V> IdentityResolver for BearerIdentity<V>
where
    V: TokenVerifier,
{
    async fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        let token = bearer_token(headers)?;
        match self.verifier.verify(token).await {
            Ok(identity) if !identity.is_empty() => Some(identity),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "token verification failed, treating request as anonymous");
                None
            }
        }
    }
}
