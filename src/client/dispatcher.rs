//! Request dispatch with admission control and bounded retries.

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::classify::HttpClientError;
use super::logger::{redact, LogSink, TracingSink};
use super::request::{Payload, RequestBody};
use super::response::{read_limited, ApiResponse};
use crate::config::{ClientSettings, RateLimitingConfig};
use crate::error::{MgTransportError, Result};
use crate::ratelimit::{Limiter, TokenBucket};

/// Path prefix of every transport API endpoint.
pub const API_PREFIX: &str = "/api/transport/v1";
/// Header carrying the identity token.
pub const TOKEN_HEADER: &str = "X-Transport-Token";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Client for one identity of the transport API.
///
/// Every attempt is admitted by the limiter first. "Too many requests"
/// answers are retried up to `max_retries` times when the limiter actually
/// throttles, so the re-admission slows the caller down. Transport failures
/// and 5xx answers are returned as classified errors; any other status is
/// handed back to the caller untouched.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: SecretString,
    http: reqwest::Client,
    limiter: Arc<dyn Limiter>,
    settings: ClientSettings,
    sink: Arc<dyn LogSink>,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    base_url: String,
    token: String,
    settings: ClientSettings,
    rate_limiting: RateLimitingConfig,
    limiter: Option<Arc<dyn Limiter>>,
    sink: Option<Arc<dyn LogSink>>,
    http: Option<reqwest::Client>,
}

impl ClientBuilder {
    /// Start building a client for `token` against `base_url`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            settings: ClientSettings::default(),
            rate_limiting: RateLimitingConfig::default(),
            limiter: None,
            sink: None,
            http: None,
        }
    }

    /// Replace all dispatch settings.
    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Emit request/response traces through the log sink.
    pub fn debug(mut self, debug: bool) -> Self {
        self.settings.debug = debug;
        self
    }

    /// Cap on response bytes read into memory.
    pub fn max_response_size(mut self, bytes: usize) -> Self {
        self.settings.max_response_size = bytes;
        self
    }

    /// Extra attempts after a "too many requests" answer.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.settings.max_retries = retries;
        self
    }

    /// Configuration of the limiter created when none is supplied.
    pub fn rate_limiting(mut self, config: RateLimitingConfig) -> Self {
        self.rate_limiting = config;
        self
    }

    /// Use a shared or custom limiter, e.g. [`NoopLimiter`](crate::ratelimit::NoopLimiter).
    pub fn limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Send traces to a custom sink.
    pub fn logger(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Reuse a preconfigured HTTP client (and its connection pool).
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Build the client.
    ///
    /// Without an explicit limiter a dedicated [`TokenBucket`] is created,
    /// which needs a tokio runtime to run its eviction task.
    pub fn build(self) -> Result<Client> {
        let base_url = self.base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url)?;

        if self.settings.max_response_size == 0 {
            return Err(MgTransportError::Config(
                "max_response_size must be positive".into(),
            ));
        }

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(self.settings.timeout())
                .build()
                .map_err(HttpClientError::transport)?,
        };

        let limiter = match self.limiter {
            Some(limiter) => limiter,
            None => Arc::new(TokenBucket::new(&self.rate_limiting)),
        };

        Ok(Client {
            base_url,
            token: SecretString::from(self.token),
            http,
            limiter,
            settings: self.settings,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
        })
    }
}

impl Client {
    /// Create a client with default settings and its own limiter.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        ClientBuilder::new(base_url, token).build()
    }

    /// Start building a client.
    pub fn builder(base_url: impl Into<String>, token: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url, token)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn limiter(&self) -> &Arc<dyn Limiter> {
        &self.limiter
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Full URL of an API path.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!("{}{}{}", self.base_url, API_PREFIX, path))?)
    }

    /// Perform one logical request.
    ///
    /// Returns the status and capped body for every completed exchange
    /// below 500, including 4xx answers and a final 429 once retries are
    /// used up.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<ApiResponse> {
        let url = self.endpoint(path)?;
        let token = self.token.expose_secret();
        let request_id = Uuid::new_v4();

        if self.settings.debug {
            self.sink.log(&format!(
                "MG TRANSPORT API Request [{}]: {} {} {} {}",
                request_id,
                method,
                url,
                redact(token),
                body.describe()
            ));
        }

        let mut payload = Payload::from(body);
        let mut attempt = 0;

        loop {
            self.limiter.admit(token).await;

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
                .header(TOKEN_HEADER, token);
            if let Some(body) = payload.next_body() {
                request = request.body(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!(request_id = %request_id, error = %e, "Transport failure");
                    return Err(HttpClientError::transport(e).into());
                }
            };
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS
                && attempt < self.settings.max_retries
                && self.limiter.is_throttling()
                && payload.can_replay()
            {
                attempt += 1;
                warn!(
                    request_id = %request_id,
                    attempt,
                    max_retries = self.settings.max_retries,
                    "Gateway rate limit hit, retrying"
                );
                continue;
            }

            if status.is_server_error() {
                // Classify whatever part of the body arrived.
                let body = read_limited(response, self.settings.max_response_size)
                    .await
                    .unwrap_or_default();
                self.trace_response(request_id, status, &body);

                let err = HttpClientError::server(status, body);
                debug!(
                    request_id = %request_id,
                    status = status.as_u16(),
                    error = %err,
                    "Server failure"
                );
                return Err(err.into());
            }

            let body = read_limited(response, self.settings.max_response_size)
                .await
                .map_err(HttpClientError::transport)?;
            self.trace_response(request_id, status, &body);

            return Ok(ApiResponse { status, body });
        }
    }

    /// Like [`Client::execute`], but gives up with
    /// [`MgTransportError::Cancelled`] as soon as `cancel` fires, including
    /// while waiting for admission.
    pub async fn execute_with_cancel(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(path, "Request cancelled");
                Err(MgTransportError::Cancelled)
            }
            result = self.execute(method, path, body) => result,
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.execute(Method::GET, path, RequestBody::Empty).await
    }

    pub async fn post(&self, path: &str, body: RequestBody) -> Result<ApiResponse> {
        self.execute(Method::POST, path, body).await
    }

    pub async fn put(&self, path: &str, body: RequestBody) -> Result<ApiResponse> {
        self.execute(Method::PUT, path, body).await
    }

    pub async fn delete(&self, path: &str, body: RequestBody) -> Result<ApiResponse> {
        self.execute(Method::DELETE, path, body).await
    }

    /// POST raw file contents.
    pub async fn upload(&self, path: &str, data: impl Into<Bytes>) -> Result<ApiResponse> {
        self.post(path, RequestBody::Raw(data.into())).await
    }

    /// GET and decode a successful JSON answer.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path).await?.into_api_result()?.json()
    }

    /// POST a JSON payload and decode a successful JSON answer.
    pub async fn post_json<B, T>(&self, path: &str, payload: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post(path, RequestBody::json(payload)?)
            .await?
            .into_api_result()?
            .json()
    }

    /// PUT a JSON payload and decode a successful JSON answer.
    pub async fn put_json<B, T>(&self, path: &str, payload: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.put(path, RequestBody::json(payload)?)
            .await?
            .into_api_result()?
            .json()
    }

    /// DELETE with a JSON payload and decode a successful JSON answer.
    pub async fn delete_json<B, T>(&self, path: &str, payload: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.delete(path, RequestBody::json(payload)?)
            .await?
            .into_api_result()?
            .json()
    }

    fn trace_response(&self, request_id: Uuid, status: StatusCode, body: &[u8]) {
        if self.settings.debug {
            self.sink.log(&format!(
                "MG TRANSPORT API Response [{}]: {} {}",
                request_id,
                status.as_u16(),
                String::from_utf8_lossy(body)
            ));
        }
    }
}
