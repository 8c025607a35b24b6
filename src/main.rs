use axum::{middleware, routing::get, Router};
use rate_gate::config::{LoggingConfig, StoreBackend};
use rate_gate::identity::{BearerIdentity, StaticTokenVerifier};
use rate_gate::middleware::{admission_middleware, cors_layer, AdmissionState};
use rate_gate::storage::{CounterStore, MemoryStore, RedisStore};
use rate_gate::{DecisionEngine, Settings};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;
    init_tracing(&settings.logging);

    let store = build_store(&settings).await;
    let engine = Arc::new(DecisionEngine::from_settings(store, &settings));
    let resolver = Arc::new(BearerIdentity::new(StaticTokenVerifier::new(
        settings.identity.token_table(),
    )));
    let state = AdmissionState::new(engine, resolver)
        .with_failure_policy(settings.failure_policy)
        .trust_forwarded_for(settings.server.trust_forwarded_for);

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/protected", get(protected_handler))
        .layer(middleware::from_fn_with_state(state, admission_middleware))
        .layer(cors_layer(&settings.server.allowed_origins));

    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr).await?;
    info!(
        addr = %settings.server.bind_addr,
        failure_policy = ?settings.failure_policy,
        "rate-gate listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// Try Redis first, fall back to memory
async fn build_store(settings: &Settings) -> Arc<dyn CounterStore> {
    match settings.store.backend {
        StoreBackend::Redis => match RedisStore::connect(&settings.store.redis_url).await {
            Ok(store) => {
                info!(url = %settings.store.redis_url, "using redis counter store");
                Arc::new(store)
            }
            Err(e) => {
                warn!(
                    url = %settings.store.redis_url,
                    error = %e,
                    "redis unavailable, falling back to in-memory counters (not shared between instances)"
                );
                Arc::new(MemoryStore::new())
            }
        },
        StoreBackend::Memory => {
            info!("using in-memory counter store");
            Arc::new(MemoryStore::new())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn root_handler() -> &'static str {
    "API is working. You are within rate limits!"
}

async fn protected_handler() -> &'static str {
    "You are authenticated and this is a protected route."
}
