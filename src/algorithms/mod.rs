pub mod fixed_window;
pub mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use token_bucket::{BucketState, TokenBucketLimiter};
