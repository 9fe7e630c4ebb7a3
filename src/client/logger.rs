//! Pluggable sink for request/response traces.

use std::fmt;
use tracing::debug;

/// Receives trace lines when a client runs in debug mode.
pub trait LogSink: Send + Sync + fmt::Debug {
    fn log(&self, message: &str);
}

/// Default sink forwarding to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        debug!(target: "mg_transport::trace", "{}", message);
    }
}

/// Keep a short prefix of a token, enough to tell identities apart.
pub(crate) fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}***", prefix)
}
