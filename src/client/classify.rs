//! Classification of failed HTTP exchanges.

use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

use crate::error::MgTransportError;

/// Fallback message when nothing more specific is known.
pub const DEFAULT_ERROR_MESSAGE: &str = "http client error";
/// Message for an error response without a body.
pub const INTERNAL_SERVER_ERROR: &str = "internal server error";
/// Message for an error body that is not the expected JSON shape.
pub const UNMARSHAL_ERROR: &str = "cannot unmarshal response body";

/// Error payload shape returned by the gateway.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    errors: Option<Vec<String>>,
}

/// What an error response body told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorBody {
    /// Zero-length body
    Empty,
    /// Body is not `{"errors": [string, ...]}`
    Unparseable,
    /// First entry of the `errors` array
    Reported(String),
    /// Well-formed payload without a usable entry
    Unspecified,
}

impl ErrorBody {
    /// Classify a raw error body.
    ///
    /// Only the first reported error is kept; the gateway orders them by
    /// relevance and the rest are dropped.
    pub fn classify(body: &[u8]) -> Self {
        if body.is_empty() {
            return ErrorBody::Empty;
        }

        match serde_json::from_slice::<ErrorPayload>(body) {
            Err(_) => ErrorBody::Unparseable,
            Ok(payload) => match payload.errors.and_then(|errors| errors.into_iter().next()) {
                Some(first) if !first.is_empty() => ErrorBody::Reported(first),
                _ => ErrorBody::Unspecified,
            },
        }
    }

    /// Human-readable message; never empty.
    pub fn message(&self) -> &str {
        match self {
            ErrorBody::Empty => INTERNAL_SERVER_ERROR,
            ErrorBody::Unparseable => UNMARSHAL_ERROR,
            ErrorBody::Reported(message) => message,
            ErrorBody::Unspecified => DEFAULT_ERROR_MESSAGE,
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A classified HTTP failure.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request never completed (connect, DNS, timeout, broken body)
    #[error("http client error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The gateway answered with a 5xx status
    #[error("{detail}")]
    Server {
        /// Response status
        status: StatusCode,
        /// Classification of the body
        detail: ErrorBody,
        /// Raw body, capped at the client's response limit; `None` when empty
        response: Option<Bytes>,
    },

    /// The gateway rejected the request with a non-success status
    #[error("{detail}")]
    Api {
        /// Response status
        status: StatusCode,
        /// Classification of the body
        detail: ErrorBody,
    },
}

impl HttpClientError {
    /// Wrap a transport failure.
    pub fn transport(err: reqwest::Error) -> Self {
        HttpClientError::Transport(err)
    }

    /// Classify a 5xx response, keeping the raw body when there is one.
    pub fn server(status: StatusCode, body: Bytes) -> Self {
        let detail = ErrorBody::classify(&body);
        let response = if body.is_empty() { None } else { Some(body) };
        HttpClientError::Server {
            status,
            detail,
            response,
        }
    }

    /// Classify a non-success response body reported by the API.
    pub fn api(status: StatusCode, body: &[u8]) -> Self {
        HttpClientError::Api {
            status,
            detail: ErrorBody::classify(body),
        }
    }

    /// Response status, when a response was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpClientError::Transport(err) => err.status(),
            HttpClientError::Server { status, .. } | HttpClientError::Api { status, .. } => {
                Some(*status)
            }
        }
    }

    /// Body classification, when a response was received.
    pub fn detail(&self) -> Option<&ErrorBody> {
        match self {
            HttpClientError::Transport(_) => None,
            HttpClientError::Server { detail, .. } | HttpClientError::Api { detail, .. } => {
                Some(detail)
            }
        }
    }

    /// Raw body of a server failure.
    pub fn response(&self) -> Option<&[u8]> {
        match self {
            HttpClientError::Server { response, .. } => response.as_deref(),
            _ => None,
        }
    }

    /// The display message.
    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, HttpClientError::Transport(_))
    }

    pub fn is_server(&self) -> bool {
        matches!(self, HttpClientError::Server { .. })
    }

    pub fn is_api(&self) -> bool {
        matches!(self, HttpClientError::Api { .. })
    }
}

/// Find a classified HTTP error anywhere in an error's source chain.
pub fn as_client_error<'a>(
    mut err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a HttpClientError> {
    loop {
        if let Some(typed) = err.downcast_ref::<HttpClientError>() {
            return Some(typed);
        }
        // `MgTransportError::Http` is transparent and does not report the
        // wrapped error as its source.
        if let Some(typed) = err
            .downcast_ref::<MgTransportError>()
            .and_then(MgTransportError::as_http)
        {
            return Some(typed);
        }
        err = err.source()?;
    }
}
