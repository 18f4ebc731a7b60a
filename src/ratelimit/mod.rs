//! Rate limiting for connection admission and outbound traffic.
//!
//! Two independent mechanisms:
//! - `RateLimiter`: sliding-window counter per network identifier (origin
//!   address), consulted during admission, with temporary blocking of
//!   identifiers that keep hammering after hitting their limit.
//! - `ConnectionThrottle`: fixed-window token allowance owned by each
//!   connection, consulted on every direct send.

mod limiter;
mod throttle;

pub use limiter::{RateLimiter, RateLimiterStats, DEFAULT_BLOCK_DURATION};
pub use throttle::ConnectionThrottle;
