// lib.rs - employee portal client core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod auth;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod documents;
pub mod profile;
pub mod resolver;
pub mod session;
pub mod status;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use api::{ApiClient, ApiError};
pub use auth::{AuthService, RegistrationForm};
pub use capabilities::Capabilities;
pub use client::PortalClient;
pub use config::{ClientConfig, ConfigError, OfflinePolicy, Platform};
pub use connectivity::{ConnectionMonitor, ConnectionStatus};
pub use documents::{DocumentRequest, DocumentService, DOCUMENT_TYPES};
pub use profile::{ProfileService, ProfileUpdate};
pub use resolver::{EndpointResolver, ResolveError, ResolvedEndpoint};
pub use session::{Session, SessionStore, UserProfile};
pub use status::{Stage, StatusOutcome, StatusState, StatusTracker};
pub use validation::ValidationError;

use capabilities::{HttpError, KvError};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Server,
    MalformedResponse,
    Storage,
    Serialization,
    Configuration,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Server => "SERVER_ERROR",
            Self::MalformedResponse => "MALFORMED_RESPONSE",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Configuration => "CONFIG_ERROR",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::RateLimited
            | Self::Server
            | Self::Storage => ErrorSeverity::Transient,

            Self::Serialization | Self::Configuration | Self::Internal => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::MalformedResponse
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::RateLimited
                | Self::Server
                | Self::Storage
                | Self::Conflict
        )
    }

    #[must_use]
    pub const fn for_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 => Self::Authentication,
            403 => Self::Authorization,
            404 => Self::NotFound,
            408 => Self::Timeout,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    /// Text for the alert the shell shows. Validation and server messages
    /// come from the backend or the form check and are shown as they are.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to reach the server. Check that you are on the company network.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Authorization => "You don't have permission to perform this action.".into(),
            ErrorKind::Validation | ErrorKind::Server | ErrorKind::NotFound => {
                if self.message.is_empty() {
                    "The server could not process the request. Please try again.".into()
                } else {
                    self.message.clone()
                }
            }
            ErrorKind::Conflict => {
                "This action conflicts with a recent change. Please refresh and try again.".into()
            }
            ErrorKind::RateLimited => {
                "Too many requests. Please wait a moment and try again.".into()
            }
            ErrorKind::MalformedResponse | ErrorKind::Serialization => {
                "The server sent an unexpected response. Please contact support if this persists."
                    .into()
            }
            ErrorKind::Storage => {
                "Unable to save data on this device. Please free up some storage space.".into()
            }
            ErrorKind::Configuration => {
                "The app is misconfigured. Please contact support.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = ErrorKind::for_http_status(status);

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

/// Error body the backend sends alongside non-2xx statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::NetworkUnavailable => {
                AppError::new(ErrorKind::Network, "No backend server reachable")
            }
            ApiError::Timeout { timeout_ms } => {
                AppError::new(ErrorKind::Timeout, format!("Timed out after {timeout_ms}ms"))
                    .with_context("timeout_ms", timeout_ms.to_string())
            }
            ApiError::ServerError { status, message } => {
                AppError::new(ErrorKind::for_http_status(status), message)
                    .with_context("http_status", status.to_string())
            }
            ApiError::MalformedResponse { reason } => {
                AppError::new(ErrorKind::MalformedResponse, "Unexpected server response")
                    .with_internal(reason)
            }
            ApiError::Validation(v) => v.into(),
            ApiError::AuthRequired => {
                AppError::new(ErrorKind::Authentication, "Authentication required")
            }
            ApiError::Storage(kv) => kv.into(),
            ApiError::InvalidRequest { reason } => {
                AppError::new(ErrorKind::Internal, "Request could not be built")
                    .with_internal(reason)
            }
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        let error = AppError::new(ErrorKind::Validation, e.to_string());
        match e.field() {
            Some(field) => error.with_context("field", field),
            None => error,
        }
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        let severity = if e.is_retryable() {
            ErrorSeverity::Transient
        } else {
            ErrorSeverity::Permanent
        };
        let kind = match e {
            KvError::Serialization { .. } => ErrorKind::Serialization,
            _ => ErrorKind::Storage,
        };
        AppError::new(kind, "Local storage failed")
            .with_severity(severity)
            .with_internal(e.to_string())
    }
}

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        match &e {
            HttpError::Timeout { timeout_ms, request_id } => {
                AppError::new(ErrorKind::Timeout, format!("Timed out after {timeout_ms}ms"))
                    .with_context("request_id", request_id.clone())
            }
            HttpError::InvalidResponse { request_id, .. } => {
                AppError::new(ErrorKind::MalformedResponse, "Unexpected server response")
                    .with_internal(e.to_string())
                    .with_context("request_id", request_id.clone())
            }
            HttpError::ResponseTooLarge { .. } => {
                AppError::new(ErrorKind::MalformedResponse, "Unexpected server response")
                    .with_internal(e.to_string())
            }
            _ if e.is_connectivity() => {
                AppError::new(ErrorKind::Network, "Connection failed").with_internal(e.to_string())
            }
            _ => AppError::new(ErrorKind::Internal, "Request could not be built")
                .with_internal(e.to_string()),
        }
    }
}

impl From<ResolveError> for AppError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NoServerFound { attempted } => {
                AppError::new(ErrorKind::Network, "No backend server reachable")
                    .with_context("attempted", attempted.to_string())
            }
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}

/// What a shell renders for an error.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserFacingError {
    pub message: String,
    pub is_transient: bool,
    pub is_retryable: bool,
    pub error_code: String,
}

impl From<&AppError> for UserFacingError {
    fn from(e: &AppError) -> Self {
        Self {
            message: e.user_facing_message(),
            is_transient: e.severity == ErrorSeverity::Transient,
            is_retryable: e.is_retryable(),
            error_code: e.code().to_string(),
        }
    }
}

// ============================================================================
// Time
// ============================================================================

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}
