//! HTTP client for the transport API.
//!
//! - [`Client`]: admission-controlled request dispatcher with 429 retry
//! - [`HttpClientError`] and [`ErrorBody`]: classification of failed exchanges
//! - [`RequestBody`] and [`ApiResponse`]: request payloads and capped responses
//! - [`LogSink`]: destination for debug traces

mod classify;
mod dispatcher;
mod logger;
mod request;
mod response;

pub use classify::{
    as_client_error, ErrorBody, HttpClientError, DEFAULT_ERROR_MESSAGE, INTERNAL_SERVER_ERROR,
    UNMARSHAL_ERROR,
};
pub use dispatcher::{Client, ClientBuilder, API_PREFIX, TOKEN_HEADER};
pub use logger::{LogSink, TracingSink};
pub use request::RequestBody;
pub use response::ApiResponse;
