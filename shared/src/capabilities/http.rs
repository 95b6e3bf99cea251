use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const MAX_URL_LENGTH: usize = 2048;
/// A 5 MB picture grows by a third once base64-encoded into the JSON body.
pub const MAX_REQUEST_BODY_SIZE: usize = 8 * 1024 * 1024;
/// User payloads can carry the stored picture as a data URL.
pub const MAX_RESPONSE_BODY_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_TIMEOUT_MS: u64 = 120_000;

// ============================================================================
// URL
// ============================================================================

/// Absolute `http`/`https` URL with a host and no embedded credentials.
///
/// Private and loopback hosts are expected here: the backend lives on the
/// office LAN or behind the emulator gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl(Url);

impl ValidatedUrl {
    pub fn new(raw: impl Into<String>) -> Result<Self, HttpError> {
        let raw = raw.into();
        let invalid = |reason: String| HttpError::InvalidUrl {
            url: raw.chars().take(100).collect(),
            reason,
        };

        if raw.trim().is_empty() {
            return Err(invalid("empty URL".into()));
        }
        if raw.len() > MAX_URL_LENGTH {
            return Err(invalid(format!("longer than {MAX_URL_LENGTH} bytes")));
        }

        let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme '{other}'"))),
        }
        if !matches!(url.host_str(), Some(host) if !host.is_empty()) {
            return Err(invalid("missing host".into()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("credentials are not allowed in the URL".into()));
        }
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Lowercased by the parser.
    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.0.port()
    }

    pub fn path(&self) -> &str {
        self.0.path()
    }
}

impl std::fmt::Display for ValidatedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Headers
// ============================================================================

/// Case-insensitive header list; inserting a name again replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaders(Vec<(String, String)>);

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects names that are not header tokens and values that could split
    /// the header block.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        let name = name.into();
        let value = value.into();

        let valid_name = !name.is_empty()
            && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid_name {
            return Err(HttpError::InvalidHeader {
                name,
                reason: "not a valid header name".into(),
            });
        }
        if value.contains(['\r', '\n', '\0']) {
            return Err(HttpError::InvalidHeader {
                name,
                reason: "value contains control characters".into(),
            });
        }

        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.0.push((name, value));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Response headers arrive from the transport already parsed.
impl From<Vec<(String, String)>> for HttpHeaders {
    fn from(headers: Vec<(String, String)>) -> Self {
        Self(headers)
    }
}

// ============================================================================
// Request
// ============================================================================

/// The verbs the portal API uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    method: HttpMethod,
    url: ValidatedUrl,
    headers: HttpHeaders,
    body: Option<Vec<u8>>,
    timeout_ms: u64,
    request_id: String,
}

impl HttpRequest {
    /// Starts with a 10s timeout and a fresh request id.
    pub fn new(method: HttpMethod, url: ValidatedUrl) -> Self {
        Self {
            method,
            url,
            headers: HttpHeaders::new(),
            body: None,
            timeout_ms: 10_000,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn get(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self::new(HttpMethod::Get, ValidatedUrl::new(url)?))
    }

    pub fn post(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self::new(HttpMethod::Post, ValidatedUrl::new(url)?))
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn with_bearer(self, token: &str) -> Result<Self, HttpError> {
        self.with_header("Authorization", format!("Bearer {token}"))
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Result<Self, HttpError> {
        if self.method == HttpMethod::Get {
            return Err(HttpError::InvalidRequest {
                reason: "GET requests carry no body".into(),
            });
        }
        if body.len() > MAX_REQUEST_BODY_SIZE {
            return Err(HttpError::BodyTooLarge {
                size: body.len(),
                max: MAX_REQUEST_BODY_SIZE,
            });
        }
        self.body = Some(body);
        Ok(self)
    }

    pub fn with_json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, HttpError> {
        let body = serde_json::to_vec(value).map_err(|e| HttpError::InvalidRequest {
            reason: format!("body does not serialize: {e}"),
        })?;
        self.with_header("Content-Type", JSON_CONTENT_TYPE)?
            .with_body(body)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, HttpError> {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 || ms > MAX_TIMEOUT_MS {
            return Err(HttpError::InvalidRequest {
                reason: format!("timeout must be between 1 and {MAX_TIMEOUT_MS}ms"),
            });
        }
        self.timeout_ms = ms;
        Ok(self)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &ValidatedUrl {
        &self.url
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

// ============================================================================
// Errors and response
// ============================================================================

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("request body of {size} bytes exceeds {max} bytes")]
    BodyTooLarge { size: usize, max: usize },

    #[error("response body of {size} bytes exceeds {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("cannot connect to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("unreadable response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

impl HttpError {
    /// The request never reached a server.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, HttpError::ConnectionError { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Vec<u8>,
    request_id: String,
    duration_ms: u64,
}

impl HttpResponse {
    pub fn new(
        status: u16,
        headers: HttpHeaders,
        body: Vec<u8>,
        request_id: String,
        duration_ms: u64,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            request_id,
            duration_ms,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("not JSON: {e}"),
            request_id: self.request_id.clone(),
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}

pub type HttpResult = Result<HttpResponse, HttpError>;

/// Transport the core sends its requests through.
///
/// Implementations honour [`HttpRequest::timeout`] and report transport
/// failures as [`HttpError`]; any status code is a successful exchange here.
#[async_trait]
pub trait HttpShell: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> HttpResult;
}

// ============================================================================
// reqwest transport
// ============================================================================

#[cfg(feature = "native-http")]
pub use self::native::ReqwestShell;

#[cfg(feature = "native-http")]
mod native {
    use super::{
        async_trait, HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult,
        HttpShell, MAX_RESPONSE_BODY_SIZE, MAX_TIMEOUT_MS,
    };
    use std::time::{Duration, Instant};
    use tracing::debug;

    #[derive(Clone)]
    pub struct ReqwestShell {
        client: reqwest::Client,
    }

    impl ReqwestShell {
        pub fn new() -> Result<Self, HttpError> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_millis(MAX_TIMEOUT_MS))
                .build()
                .map_err(|e| HttpError::InvalidRequest {
                    reason: format!("HTTP client unavailable: {e}"),
                })?;
            Ok(Self { client })
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    /// Refuses a body by its `Content-Length` before any of it is read.
    pub(super) fn check_declared_length(declared: Option<u64>) -> Result<(), HttpError> {
        match declared {
            Some(len) if len > MAX_RESPONSE_BODY_SIZE as u64 => Err(HttpError::ResponseTooLarge {
                size: usize::try_from(len).unwrap_or(usize::MAX),
                max: MAX_RESPONSE_BODY_SIZE,
            }),
            _ => Ok(()),
        }
    }

    fn transport_error(request: &HttpRequest, error: &reqwest::Error) -> HttpError {
        if error.is_timeout() {
            HttpError::Timeout {
                timeout_ms: request.timeout_ms(),
                request_id: request.request_id().to_string(),
            }
        } else if error.is_body() || error.is_decode() {
            HttpError::InvalidResponse {
                reason: error.to_string(),
                request_id: request.request_id().to_string(),
            }
        } else {
            HttpError::ConnectionError {
                host: request.url().host().to_string(),
                message: error.to_string(),
            }
        }
    }

    #[async_trait]
    impl HttpShell for ReqwestShell {
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            let method = match request.method() {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
            };

            let mut builder = self
                .client
                .request(method, request.url().as_str())
                .timeout(request.timeout());
            for (name, value) in request.headers().iter() {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body() {
                builder = builder.body(body.to_vec());
            }

            let started = Instant::now();
            let response = builder
                .send()
                .await
                .map_err(|e| transport_error(&request, &e))?;

            check_declared_length(response.content_length())?;

            let status = response.status().as_u16();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    Some((name.to_string(), value.to_str().ok()?.to_string()))
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| transport_error(&request, &e))?;
            // chunked bodies carry no length up front
            if body.len() > MAX_RESPONSE_BODY_SIZE {
                return Err(HttpError::ResponseTooLarge {
                    size: body.len(),
                    max: MAX_RESPONSE_BODY_SIZE,
                });
            }

            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            debug!(
                method = %request.method(),
                url = %request.url(),
                status,
                duration_ms,
                "request finished"
            );

            Ok(HttpResponse::new(
                status,
                HttpHeaders::from(headers),
                body.to_vec(),
                request.request_id().to_string(),
                duration_ms,
            ))
        }
    }
}
