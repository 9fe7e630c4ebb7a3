//! Per-identity rate limiting.
//!
//! - [`Limiter`]: admission interface consumed by the dispatcher
//! - [`TokenBucket`]: sharded fixed window limiter with idle eviction
//! - [`NoopLimiter`]: pass-through limiter for trusted callers
//! - [`RateToken`]: the per-identity window arithmetic

mod backend;
mod bucket;
mod shard;
mod token;

pub use backend::{Limiter, NoopLimiter};
pub use bucket::TokenBucket;
pub use token::RateToken;
