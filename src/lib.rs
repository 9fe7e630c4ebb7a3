//! MG Transport - rate-limited client for the MG transport API
//!
//! This crate wraps the transport API behind per-identity admission control.
//! A sharded token bucket paces every identity independently, the dispatcher
//! retries "too many requests" answers through that bucket, and failures are
//! classified as transport, server or API errors. A TTL cache of clients keyed
//! by identity serves multi-tenant hosts.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod pool;
pub mod ratelimit;

pub use client::{ApiResponse, Client, ClientBuilder, HttpClientError, RequestBody};
pub use config::TransportConfig;
pub use error::{MgTransportError, Result};
pub use pool::ClientPool;
pub use ratelimit::{Limiter, NoopLimiter, TokenBucket};
