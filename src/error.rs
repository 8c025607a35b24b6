#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    // store unreachable, command failed or round trip timed out
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),
    // stored value failed to parse; algorithms recover from this locally
    #[error("Invalid state at {key}: {value:?}")]
    InvalidState { key: String, value: String },
    // optimistic update kept losing to concurrent writers
    #[error("Contention on {key} after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
    //config error
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(err: config::ConfigError) -> Self {
        RateLimitError::ConfigError(err.to_string())
    }
}

impl RateLimitError {
    /// Short reason class used in logs and failure responses.
    pub fn reason(&self) -> &'static str {
        match self {
            RateLimitError::StoreUnavailable(_) => "store_unavailable",
            RateLimitError::InvalidState { .. } => "invalid_state",
            RateLimitError::Contention { .. } => "store_contention",
            RateLimitError::ConfigError(_) => "config_error",
        }
    }
}

// result type alias for convenience
pub type Result<T> = std::result::Result<T, RateLimitError>;
