use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::capabilities::{
    Capabilities, HttpError, HttpMethod, HttpRequest, HttpResponse, HttpShell, KvError,
    ValidatedUrl, JSON_CONTENT_TYPE,
};
use crate::resolver::EndpointResolver;
use crate::validation::ValidationError;

/// Outcome of a backend call other than success.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("no backend server reachable")]
    NetworkUnavailable,

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("authentication required")]
    AuthRequired,

    #[error("local storage failed: {0}")]
    Storage(#[from] KvError),

    #[error("request could not be built: {reason}")]
    InvalidRequest { reason: String },
}

impl ApiError {
    pub fn is_offline(&self) -> bool {
        matches!(self, ApiError::NetworkUnavailable | ApiError::Timeout { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub path: &'static str,
    pub authenticated: bool,
}

pub mod endpoints {
    use super::Endpoint;
    use crate::capabilities::HttpMethod;

    const fn public(method: HttpMethod, path: &'static str) -> Endpoint {
        Endpoint {
            method,
            path,
            authenticated: false,
        }
    }

    const fn protected(method: HttpMethod, path: &'static str) -> Endpoint {
        Endpoint {
            method,
            path,
            authenticated: true,
        }
    }

    pub const HEALTH: Endpoint = public(HttpMethod::Get, "/health");
    pub const LOGIN: Endpoint = public(HttpMethod::Post, "/login");
    pub const REGISTER: Endpoint = public(HttpMethod::Post, "/register");
    pub const FORGOT_PASSWORD: Endpoint = public(HttpMethod::Post, "/forgot-password");
    pub const RESET_PASSWORD: Endpoint = public(HttpMethod::Post, "/reset-password");
    pub const ME: Endpoint = protected(HttpMethod::Get, "/me");
    pub const UPDATE_PROFILE: Endpoint = protected(HttpMethod::Put, "/update-profile");
    pub const UPLOAD_PROFILE_PICTURE: Endpoint =
        protected(HttpMethod::Post, "/upload-profile-picture");
    pub const DOCUMENT_REQUEST: Endpoint = protected(HttpMethod::Post, "/document-request");
    pub const DOCUMENT_REQUESTS: Endpoint = protected(HttpMethod::Get, "/document-requests");
}

/// Single entry point for backend calls: resolves the base URL, applies the
/// JSON headers, timeout and bearer token, and classifies the result.
pub struct ApiClient {
    http: Arc<dyn HttpShell>,
    resolver: Arc<EndpointResolver>,
    request_timeout: Duration,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(caps: &Capabilities, resolver: Arc<EndpointResolver>) -> Self {
        let request_timeout = resolver.config().request_timeout();
        Self {
            http: caps.http.clone(),
            resolver,
            request_timeout,
        }
    }

    pub fn resolver(&self) -> &Arc<EndpointResolver> {
        &self.resolver
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        token: Option<&SecretString>,
    ) -> Result<T, ApiError> {
        self.send::<(), T>(endpoint, None, token).await
    }

    #[instrument(skip(self, body, token), fields(path = endpoint.path))]
    pub async fn send<B, T>(
        &self,
        endpoint: Endpoint,
        body: Option<&B>,
        token: Option<&SecretString>,
    ) -> Result<T, ApiError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        if endpoint.authenticated && token.is_none() {
            debug!("no session token, skipping request");
            return Err(ApiError::AuthRequired);
        }

        let payload = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| ApiError::InvalidRequest {
                reason: e.to_string(),
            })?;
        let bearer = token.map(|t| t.expose_secret().clone());

        let base_url = self.resolver.base_url().await.map_err(|e| {
            warn!(error = %e, "backend unreachable");
            ApiError::NetworkUnavailable
        })?;

        let request = self.build_request(&base_url, endpoint, payload, bearer.as_deref())?;
        let timeout_ms = request.timeout_ms();

        let response = match tokio::time::timeout(self.request_timeout, self.http.execute(request))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.classify_transport(e).await),
            Err(_) => {
                warn!(timeout_ms, "request timed out");
                return Err(ApiError::Timeout { timeout_ms });
            }
        };

        classify_response(endpoint, &response)
    }

    /// `true` when the backend answers `/health`. A cached endpoint that stops
    /// answering is dropped and discovery runs again.
    pub async fn check_health(&self) -> bool {
        if let Some(endpoint) = self.resolver.cached().await {
            if self.resolver.probe(&endpoint.candidate).await {
                return true;
            }
            warn!(host = endpoint.candidate.host(), "cached endpoint stopped answering");
            self.resolver.reset().await;
        }
        self.resolver.resolve().await.is_ok()
    }

    fn build_request(
        &self,
        base_url: &str,
        endpoint: Endpoint,
        payload: Option<Vec<u8>>,
        bearer: Option<&str>,
    ) -> Result<HttpRequest, ApiError> {
        let url = ValidatedUrl::new(format!("{}{}", base_url, endpoint.path))?;
        let mut request = HttpRequest::new(endpoint.method, url)
            .with_header("Content-Type", JSON_CONTENT_TYPE)?
            .with_header("Accept", JSON_CONTENT_TYPE)?
            .with_timeout(self.request_timeout)?;
        if let Some(token) = bearer {
            request = request.with_bearer(token)?;
        }
        if let Some(payload) = payload {
            request = request.with_body(payload)?;
        }
        Ok(request)
    }

    async fn classify_transport(&self, error: HttpError) -> ApiError {
        match error {
            HttpError::Timeout { timeout_ms, .. } => ApiError::Timeout { timeout_ms },
            e if e.is_connectivity() => {
                warn!(error = %e, "connection failed, resetting endpoint");
                self.resolver.reset().await;
                ApiError::NetworkUnavailable
            }
            HttpError::InvalidResponse { reason, .. } => ApiError::MalformedResponse { reason },
            HttpError::ResponseTooLarge { size, max } => ApiError::MalformedResponse {
                reason: format!("response of {} bytes exceeds {} bytes", size, max),
            },
            e => e.into(),
        }
    }
}

impl From<HttpError> for ApiError {
    fn from(e: HttpError) -> Self {
        ApiError::InvalidRequest {
            reason: e.to_string(),
        }
    }
}

fn server_message(body: &serde_json::Value, status: u16) -> String {
    body.get("message")
        .and_then(serde_json::Value::as_str)
        .filter(|m| !m.is_empty())
        .map_or_else(|| format!("HTTP error: {}", status), str::to_string)
}

/// Status and body classification, independent of transport.
pub fn classify_response<T: DeserializeOwned>(
    endpoint: Endpoint,
    response: &HttpResponse,
) -> Result<T, ApiError> {
    let status = response.status();

    if status == 401 && endpoint.authenticated {
        return Err(ApiError::AuthRequired);
    }

    let body: serde_json::Value = response.json().map_err(|e| {
        warn!(status, error = %e, "unparseable response body");
        ApiError::MalformedResponse {
            reason: e.to_string(),
        }
    })?;

    if !response.is_success() {
        return Err(ApiError::ServerError {
            status,
            message: server_message(&body, status),
        });
    }

    if body.get("success").and_then(serde_json::Value::as_bool) == Some(false) {
        return Err(ApiError::ServerError {
            status,
            message: server_message(&body, status),
        });
    }

    serde_json::from_value(body).map_err(|e| ApiError::MalformedResponse {
        reason: e.to_string(),
    })
}
