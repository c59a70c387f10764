// API gateway module: the blocking HTTP client that every other part of
// the crate talks through. It knows how to build URLs, attach the bearer
// token and user agent, read rate-limit headers and turn non-2xx answers
// into a structured `ApiError`. Nothing in here knows about streams or
// uploads; those live in `stream` and `media` and only see the `Gateway`
// trait, which keeps them testable without a network.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{multipart, Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::config::Config;

/// Query parameters. A sorted map keeps the generated URLs stable.
pub type Query = BTreeMap<String, String>;

/// Connect timeout used by the streaming client.
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors produced by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("read response body: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("bearer token contains characters not allowed in a header")]
    InvalidToken,
}

impl GatewayError {
    /// The structured API error, if this failure came from a non-2xx answer.
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            GatewayError::Api(err) => Some(err),
            _ => None,
        }
    }
}

/// A single `{code, message}` entry of an error payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Structured non-2xx answer from the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ApiError {
    pub status: u16,
    pub errors: Vec<ApiErrorDetail>,
    /// `detail` (or `title`) of a v2 problem document, when present.
    pub detail: Option<String>,
    pub rate_limits: RateLimitSnapshot,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "twitter api error: status {}", self.status)?;
        for entry in &self.errors {
            write!(f, "; code={} message={}", entry.code, entry.message)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "; detail={detail}")?;
        }
        Ok(())
    }
}

impl ApiError {
    /// Build an error from a status code and the raw response body.
    pub fn from_body(status: u16, body: &str, rate_limits: RateLimitSnapshot) -> Self {
        #[derive(Deserialize, Default)]
        struct ErrorBody {
            #[serde(default)]
            errors: Vec<ApiErrorDetail>,
            title: Option<String>,
            detail: Option<String>,
        }

        // An empty or non-JSON body still produces an ApiError, just without entries.
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        ApiError {
            status,
            errors: parsed.errors,
            detail: parsed.detail.or(parsed.title),
            rate_limits,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }
}

/// Rate limit headers of one response. `None` means the header was
/// missing or not a number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    /// Unix timestamp (seconds) at which the window resets.
    pub reset: Option<i64>,
}

impl RateLimitSnapshot {
    /// Parse `x-rate-limit-*` headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let parse = |key: &str| {
            headers
                .get(key)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
        };
        RateLimitSnapshot {
            limit: parse("x-rate-limit-limit"),
            remaining: parse("x-rate-limit-remaining"),
            reset: parse("x-rate-limit-reset"),
        }
    }

    /// Time left until the window resets, measured from `now` (unix seconds).
    pub fn reset_in(&self, now: i64) -> Option<Duration> {
        self.reset
            .map(|reset| Duration::from_secs(reset.saturating_sub(now).max(0) as u64))
    }
}

/// Request body variants used by the crate.
#[derive(Debug, Clone)]
pub enum Payload {
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded` fields.
    Form(Vec<(String, String)>),
    /// `multipart/form-data` with text fields and one binary part.
    Multipart {
        fields: Vec<(String, String)>,
        file_field: String,
        file_name: String,
        bytes: Vec<u8>,
    },
}

/// A response whose body has not been read yet.
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Box<dyn Read + Send>,
}

impl fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl ApiResponse {
    pub fn new(status: u16, headers: HeaderMap, body: Box<dyn Read + Send>) -> Self {
        ApiResponse {
            status,
            headers,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn rate_limits(&self) -> RateLimitSnapshot {
        RateLimitSnapshot::from_headers(&self.headers)
    }

    /// Pass 2xx responses through and turn everything else into an `ApiError`.
    pub fn error_for_status(mut self) -> Result<Self, GatewayError> {
        if self.is_success() {
            return Ok(self);
        }
        let rate_limits = self.rate_limits();
        let mut body = String::new();
        // A broken error body is not worth masking the status code for.
        let _ = self.body.read_to_string(&mut body);
        Err(ApiError::from_body(self.status, &body, rate_limits).into())
    }

    /// Decode the whole body as JSON.
    pub fn json<T: DeserializeOwned>(self) -> Result<T, GatewayError> {
        Ok(serde_json::from_reader(self.body)?)
    }
}

/// The request contract the stream consumer and upload pipeline rely on.
pub trait Gateway {
    fn get(&self, path: &str, query: &Query) -> Result<ApiResponse, GatewayError>;

    /// Like `get`, but for long-lived responses that must not time out.
    fn get_streaming(&self, path: &str, query: &Query) -> Result<ApiResponse, GatewayError>;

    fn post(&self, path: &str, payload: Payload, query: &Query)
        -> Result<ApiResponse, GatewayError>;

    fn delete(&self, path: &str, query: &Query) -> Result<ApiResponse, GatewayError>;
}

/// `reqwest` backed gateway. Holds two clients: a regular one with the
/// configured timeout and one for streaming. The blocking client applies
/// its timeout to every single read, so the streaming client uses the
/// stall timeout: a silent connection fails its read and gets closed
/// instead of lingering next to the replacement connection.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    stream_client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Build a client from the resolved configuration.
    pub fn new(config: &Config) -> Result<Self, GatewayError> {
        let base_url = parse_base_url(&config.base_url)?;
        let headers = default_headers(config.bearer_token.as_deref())?;

        let client = Client::builder()
            .default_headers(headers.clone())
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;
        let stream_client = Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .connect_timeout(STREAM_CONNECT_TIMEOUT)
            .timeout(config.stream.stall_timeout)
            .build()?;

        Ok(ApiClient {
            client,
            stream_client,
            base_url,
        })
    }

    /// Resolve `path` against the base URL. Absolute URLs are kept as-is.
    fn resolve(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(path.trim())
            .map_err(|e| GatewayError::InvalidUrl {
                url: path.to_string(),
                reason: e.to_string(),
            })
    }

    fn request(
        &self,
        client: &Client,
        method: Method,
        path: &str,
        query: &Query,
    ) -> Result<RequestBuilder, GatewayError> {
        let url = self.resolve(path)?;
        tracing::debug!(%method, %url, "sending request");
        let mut req = client.request(method, url);
        if !query.is_empty() {
            req = req.query(query);
        }
        Ok(req)
    }

    fn send(req: RequestBuilder) -> Result<ApiResponse, GatewayError> {
        let res = req.send()?;
        let status = res.status().as_u16();
        let headers = res.headers().clone();
        tracing::debug!(status, "received response");
        Ok(ApiResponse::new(status, headers, Box::new(res)))
    }
}

impl Gateway for ApiClient {
    fn get(&self, path: &str, query: &Query) -> Result<ApiResponse, GatewayError> {
        Self::send(self.request(&self.client, Method::GET, path, query)?)
    }

    fn get_streaming(&self, path: &str, query: &Query) -> Result<ApiResponse, GatewayError> {
        Self::send(self.request(&self.stream_client, Method::GET, path, query)?)
    }

    fn post(
        &self,
        path: &str,
        payload: Payload,
        query: &Query,
    ) -> Result<ApiResponse, GatewayError> {
        let req = self.request(&self.client, Method::POST, path, query)?;
        let req = match payload {
            Payload::Json(value) => req.json(&value),
            Payload::Form(fields) => req.form(&fields),
            Payload::Multipart {
                fields,
                file_field,
                file_name,
                bytes,
            } => {
                let mut form = multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key, value);
                }
                let part = multipart::Part::bytes(bytes).file_name(file_name);
                req.multipart(form.part(file_field, part))
            }
        };
        Self::send(req)
    }

    fn delete(&self, path: &str, query: &Query) -> Result<ApiResponse, GatewayError> {
        Self::send(self.request(&self.client, Method::DELETE, path, query)?)
    }
}

/// Parse the base URL and make sure it ends with `/` so relative paths
/// are appended instead of replacing the last segment.
fn parse_base_url(raw: &str) -> Result<Url, GatewayError> {
    let trimmed = raw.trim();
    let invalid = |reason: String| GatewayError::InvalidUrl {
        url: trimmed.to_string(),
        reason,
    };
    let mut url = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(invalid("missing scheme or host".into()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Authorization header map, empty when no token is configured.
fn default_headers(token: Option<&str>) -> Result<HeaderMap, GatewayError> {
    let mut headers = HeaderMap::new();
    if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| GatewayError::InvalidToken)?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}
