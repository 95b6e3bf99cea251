use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 5000;

/// Loopback, emulator gateway and the usual home/office LAN addresses,
/// probed in this order once the hint and the last-known host fail.
pub const DEFAULT_CANDIDATE_HOSTS: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "10.0.2.2",
    "192.168.1.16",
    "192.168.0.1",
    "192.168.0.2",
    "192.168.0.3",
    "192.168.0.4",
    "192.168.0.5",
    "192.168.1.1",
    "192.168.1.2",
    "192.168.1.3",
    "192.168.1.4",
    "192.168.1.5",
    "10.0.0.1",
    "10.0.0.2",
    "10.0.0.3",
    "10.0.0.4",
    "10.0.0.5",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the shell is running, used to derive the first address to try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Platform {
    /// Browser build served from the developer machine.
    Web,
    /// Device or emulator; `host_uri` is what the dev runtime reports for
    /// its bundler, e.g. `192.168.1.20:8081` or `exp://192.168.1.20:8081`.
    Native { host_uri: Option<String> },
}

impl Default for Platform {
    fn default() -> Self {
        Platform::Native { host_uri: None }
    }
}

impl Platform {
    pub fn host_hint(&self) -> Option<String> {
        match self {
            Platform::Web => Some("localhost".to_string()),
            Platform::Native { host_uri } => host_uri.as_deref().and_then(host_from_uri),
        }
    }
}

/// Host part of a `[scheme://]host[:port][/path]` string.
pub fn host_from_uri(uri: &str) -> Option<String> {
    let trimmed = uri.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    let host = authority.split(':').next().unwrap_or_default().trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// What `restore_session` does when `/me` cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflinePolicy {
    /// Keep the persisted session and let the user work offline.
    #[default]
    TrustCachedSession,
    /// Treat an unverifiable session as logged out.
    FailClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub port: u16,
    pub probe_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub resolve_poll_interval_ms: u64,
    pub resolve_max_wait_polls: u32,
    pub health_check_interval_ms: u64,
    pub candidate_hosts: Vec<String>,
    pub platform: Platform,
    pub offline_policy: OfflinePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            probe_timeout_ms: 2_000,
            request_timeout_ms: 10_000,
            resolve_poll_interval_ms: 100,
            resolve_max_wait_polls: 50,
            health_check_interval_ms: 30_000,
            candidate_hosts: DEFAULT_CANDIDATE_HOSTS
                .iter()
                .map(|h| (*h).to_string())
                .collect(),
            platform: Platform::default(),
            offline_policy: OfflinePolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be > 0".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be > 0".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }
        if self.request_timeout_ms > crate::capabilities::MAX_TIMEOUT_MS {
            return Err(ConfigError::Invalid(format!(
                "request_timeout_ms must be <= {}",
                crate::capabilities::MAX_TIMEOUT_MS
            )));
        }
        if self.resolve_poll_interval_ms == 0 || self.resolve_max_wait_polls == 0 {
            return Err(ConfigError::Invalid(
                "resolve wait bounds must be > 0".into(),
            ));
        }
        if self.health_check_interval_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "health_check_interval_ms should be at least 1000ms".into(),
            ));
        }
        if self.candidate_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "candidate_hosts cannot contain empty entries".into(),
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Upper bound a caller waits on someone else's in-flight resolution.
    pub fn resolve_max_wait(&self) -> Duration {
        Duration::from_millis(
            self.resolve_poll_interval_ms
                .saturating_mul(u64::from(self.resolve_max_wait_polls)),
        )
    }
}
