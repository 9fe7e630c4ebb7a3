//! Completed HTTP exchanges.

use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::classify::HttpClientError;
use crate::error::Result;

/// Status and capped body of a completed request.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Response status
    pub status: StatusCode,
    /// Response body, truncated at the client's response limit
    pub body: Bytes,
}

impl ApiResponse {
    /// Whether the gateway accepted the request (200 or 201).
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK || self.status == StatusCode::CREATED
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Keep successful responses, turn the rest into API errors.
    pub fn into_api_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HttpClientError::api(self.status, &self.body).into())
        }
    }
}

/// Read at most `limit` bytes of the response body; the rest is discarded.
pub(crate) async fn read_limited(
    mut response: reqwest::Response,
    limit: usize,
) -> std::result::Result<Bytes, reqwest::Error> {
    let hint = response
        .content_length()
        .map_or(0, |len| len.min(limit as u64) as usize);
    let mut buf = BytesMut::with_capacity(hint);

    while let Some(chunk) = response.chunk().await? {
        let remaining = limit - buf.len();
        if chunk.len() >= remaining {
            buf.extend_from_slice(&chunk[..remaining]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf.freeze())
}
