//! Error types for the transport client.

use thiserror::Error;

use crate::client::HttpClientError;

/// Main error type for transport client operations.
#[derive(Error, Debug)]
pub enum MgTransportError {
    /// A classified HTTP failure (transport, server or API level)
    #[error(transparent)]
    Http(#[from] HttpClientError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request was cancelled before it completed
    #[error("request cancelled")]
    Cancelled,

    /// The client pool was closed
    #[error("client pool is closed")]
    PoolClosed,

    /// The request URL could not be built
    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON encoding or decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MgTransportError {
    /// The classified HTTP error, if this is one.
    pub fn as_http(&self) -> Option<&HttpClientError> {
        match self {
            MgTransportError::Http(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for transport client operations.
pub type Result<T> = std::result::Result<T, MgTransportError>;
