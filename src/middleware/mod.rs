pub mod rate_limiting;
pub mod request_logging;

pub use rate_limiting::{RateLimitConfig, RateLimiter};
pub use request_logging::RequestLog;
