mod cors;
mod rate_limit;

pub use cors::cors_layer;
pub use rate_limit::admission_middleware;
pub use rate_limit::AdmissionState;
pub use rate_limit::{LIMIT_HEADER, REMAINING_HEADER};
