//! Outgoing request bodies.

use bytes::Bytes;
use serde::Serialize;
use std::borrow::Cow;

use crate::error::Result;

/// Placeholder written to traces instead of file contents.
pub(crate) const FILE_PLACEHOLDER: &str = "[file data]";

/// Body of an outgoing request.
#[derive(Debug, Default)]
pub enum RequestBody {
    /// No body
    #[default]
    Empty,
    /// Encoded JSON document
    Json(Bytes),
    /// Raw file contents; never written to traces
    Raw(Bytes),
    /// Streamed file contents; sent once and never written to traces
    Stream(reqwest::Body),
}

impl RequestBody {
    /// Encode `value` as a JSON body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(RequestBody::Json(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Trace representation of the body.
    pub(crate) fn describe(&self) -> Cow<'_, str> {
        match self {
            RequestBody::Empty => Cow::Borrowed(""),
            RequestBody::Json(bytes) => String::from_utf8_lossy(bytes),
            RequestBody::Raw(_) | RequestBody::Stream(_) => Cow::Borrowed(FILE_PLACEHOLDER),
        }
    }
}

/// A body that can be attached to one or more attempts.
#[derive(Debug)]
pub(crate) enum Payload {
    /// Cheaply cloneable bytes, resent on every attempt
    Replayable(Option<Bytes>),
    /// Consumed by the first attempt
    OneShot(Option<reqwest::Body>),
}

impl Payload {
    /// Body for the next attempt, if any.
    pub(crate) fn next_body(&mut self) -> Option<reqwest::Body> {
        match self {
            Payload::Replayable(bytes) => bytes.clone().map(reqwest::Body::from),
            Payload::OneShot(body) => body.take(),
        }
    }

    /// Whether another attempt would carry the same body.
    pub(crate) fn can_replay(&self) -> bool {
        matches!(self, Payload::Replayable(_))
    }
}

impl From<RequestBody> for Payload {
    fn from(body: RequestBody) -> Self {
        match body {
            RequestBody::Empty => Payload::Replayable(None),
            RequestBody::Json(bytes) | RequestBody::Raw(bytes) => Payload::Replayable(Some(bytes)),
            RequestBody::Stream(body) => Payload::OneShot(Some(body)),
        }
    }
}
