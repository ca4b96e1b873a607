pub mod queue;
pub mod rate_limiter;

pub use queue::{BusMetrics, MessageBus};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
