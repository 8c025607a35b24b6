use super::rate_limit::{LIMIT_HEADER, REMAINING_HEADER};
use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

/// CORS for browser callers.
///
/// The quota headers are exposed so a cross-origin client can read its own
/// limit and throttle itself. Preflight requests are answered here and never
/// reach the admission middleware.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        AllowOrigin::any()
    } else {
        let origins = allowed_origins.iter().filter_map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| warn!(origin, "invalid CORS origin in config, skipping"))
                .ok()
        });
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .expose_headers([LIMIT_HEADER, REMAINING_HEADER])
}
