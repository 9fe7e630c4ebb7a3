//! Limiter trait for abstracting throttling and pass-through implementations.

use async_trait::async_trait;
use std::fmt;

/// Trait for limiter implementations.
///
/// This trait abstracts over the sharded [`TokenBucket`](super::TokenBucket)
/// and the [`NoopLimiter`] so the dispatcher can work with either.
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Wait until `identity` may send one more request, then record it.
    ///
    /// Never fails; overload only shows up as a delay.
    async fn admit(&self, identity: &str);

    /// Whether admissions can actually delay the caller.
    ///
    /// The dispatcher only retries "too many requests" responses when this
    /// is `true`, since re-admission is what slows the caller down.
    fn is_throttling(&self) -> bool {
        true
    }
}

/// A limiter that admits everything immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

#[async_trait]
impl Limiter for NoopLimiter {
    async fn admit(&self, _identity: &str) {}

    fn is_throttling(&self) -> bool {
        false
    }
}
