//! Backend endpoint discovery.
//!
//! The backend runs on a developer machine whose LAN address changes between
//! sessions, so the client probes a short list of candidates instead of
//! relying on a fixed URL. Candidates are tried in order:
//!
//! 1. the host derived from the platform (web origin or dev-runtime host URI)
//! 2. the last host that answered, read from the key/value store
//! 3. [`ClientConfig::candidate_hosts`]
//!
//! The first host whose `GET /health` succeeds wins, is persisted under
//! [`StorageKey::LastWorkingIp`] and cached until [`EndpointResolver::reset`].
//! Concurrent callers share a single discovery run.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Capabilities, HttpRequest, HttpShell, KeyValueStore, StorageKey};
use crate::config::{ClientConfig, ConfigError};
use crate::UnixTimeMs;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    host: String,
    port: u16,
}

impl Candidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host: String = host.into();
        Self {
            host: host.trim().to_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateSource {
    PlatformHint,
    LastKnownGood,
    CommonAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    pub candidate: Candidate,
    pub base_url: String,
    pub source: CandidateSource,
    pub resolved_at: UnixTimeMs,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no backend server reachable ({attempted} candidates probed)")]
    NoServerFound { attempted: usize },
}

pub type ResolveOutcome = Result<ResolvedEndpoint, ResolveError>;

#[derive(Debug, Default)]
pub struct ResolverMetrics {
    pub discoveries: AtomicU64,
    pub probes: AtomicU64,
    pub coalesced_waits: AtomicU64,
    pub wait_timeouts: AtomicU64,
    pub persist_failures: AtomicU64,
}

impl ResolverMetrics {
    pub fn snapshot(&self) -> ResolverMetricsSnapshot {
        ResolverMetricsSnapshot {
            discoveries: self.discoveries.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverMetricsSnapshot {
    pub discoveries: u64,
    pub probes: u64,
    pub coalesced_waits: u64,
    pub wait_timeouts: u64,
    pub persist_failures: u64,
}

// ============================================================================
// Resolver State
// ============================================================================

#[derive(Default)]
struct ResolverState {
    cached: Option<ResolvedEndpoint>,
    /// Present while a discovery run is active; the leader publishes its
    /// outcome here.
    in_flight: Option<watch::Receiver<Option<ResolveOutcome>>>,
    /// Bumped by `reset` so a run started before it cannot repopulate the cache.
    generation: u64,
}

impl ResolverState {
    fn live_in_flight(&self) -> Option<watch::Receiver<Option<ResolveOutcome>>> {
        self.in_flight
            .as_ref()
            .filter(|rx| rx.has_changed().is_ok())
            .cloned()
    }
}

pub struct EndpointResolver {
    http: Arc<dyn HttpShell>,
    kv: Arc<dyn KeyValueStore>,
    config: ClientConfig,
    state: Mutex<ResolverState>,
    metrics: ResolverMetrics,
}

impl std::fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("port", &self.config.port)
            .field("candidates", &self.config.candidate_hosts.len())
            .finish_non_exhaustive()
    }
}

impl EndpointResolver {
    pub fn new(caps: &Capabilities, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            http: caps.http.clone(),
            kv: caps.kv.clone(),
            config,
            state: Mutex::new(ResolverState::default()),
            metrics: ResolverMetrics::default(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> ResolverMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cached endpoint, if any, without probing.
    pub async fn cached(&self) -> Option<ResolvedEndpoint> {
        self.state.lock().await.cached.clone()
    }

    pub async fn base_url(&self) -> Result<String, ResolveError> {
        self.resolve().await.map(|endpoint| endpoint.base_url)
    }

    /// Forget the cached endpoint. The next `resolve` probes again.
    #[instrument(skip(self))]
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.cached = None;
        state.in_flight = None;
        state.generation = state.generation.wrapping_add(1);
        info!("endpoint detection reset");
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self) -> ResolveOutcome {
        let (tx, generation) = {
            let mut state = self.state.lock().await;
            if let Some(endpoint) = &state.cached {
                return Ok(endpoint.clone());
            }
            if let Some(rx) = state.live_in_flight() {
                drop(state);
                self.metrics.coalesced_waits.fetch_add(1, Ordering::Relaxed);
                return self.await_in_flight(rx).await;
            }
            let (tx, rx) = watch::channel(None);
            state.in_flight = Some(rx);
            (tx, state.generation)
        };

        self.metrics.discoveries.fetch_add(1, Ordering::Relaxed);
        let outcome = self.discover().await;

        {
            let mut state = self.state.lock().await;
            if state.generation == generation {
                state.in_flight = None;
                if let Ok(endpoint) = &outcome {
                    state.cached = Some(endpoint.clone());
                }
            }
        }
        tx.send_replace(Some(outcome.clone()));
        outcome
    }

    async fn await_in_flight(
        &self,
        mut rx: watch::Receiver<Option<ResolveOutcome>>,
    ) -> ResolveOutcome {
        debug!("resolution already in flight, waiting");
        let max_wait = self.config.resolve_max_wait();
        let waited = tokio::time::timeout(max_wait, async {
            rx.wait_for(Option::is_some)
                .await
                .map(|outcome| (*outcome).clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(Ok(None)) | Ok(Err(_)) => {
                warn!("in-flight resolution abandoned");
                self.fallback().await
            }
            Err(_) => {
                self.metrics.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    max_wait_ms = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX),
                    "timed out waiting for in-flight resolution"
                );
                self.fallback().await
            }
        }
    }

    async fn fallback(&self) -> ResolveOutcome {
        self.cached()
            .await
            .ok_or(ResolveError::NoServerFound { attempted: 0 })
    }

    async fn discover(&self) -> ResolveOutcome {
        let mut attempted: Vec<String> = Vec::new();

        if let Some(host) = self.config.platform.host_hint() {
            if let Some(endpoint) = self
                .try_candidate(&mut attempted, &host, CandidateSource::PlatformHint)
                .await
            {
                return Ok(endpoint);
            }
        }

        match self.kv.get(StorageKey::LastWorkingIp).await {
            Ok(Some(host)) if !host.trim().is_empty() => {
                if let Some(endpoint) = self
                    .try_candidate(&mut attempted, &host, CandidateSource::LastKnownGood)
                    .await
                {
                    return Ok(endpoint);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read last working host"),
        }

        for host in &self.config.candidate_hosts {
            if let Some(endpoint) = self
                .try_candidate(&mut attempted, host, CandidateSource::CommonAddress)
                .await
            {
                return Ok(endpoint);
            }
        }

        warn!(attempted = attempted.len(), "no backend server reachable");
        Err(ResolveError::NoServerFound {
            attempted: attempted.len(),
        })
    }

    async fn try_candidate(
        &self,
        attempted: &mut Vec<String>,
        host: &str,
        source: CandidateSource,
    ) -> Option<ResolvedEndpoint> {
        let candidate = Candidate::new(host, self.config.port);
        if attempted.iter().any(|h| h == candidate.host()) {
            debug!(host = candidate.host(), "skipping already probed host");
            return None;
        }
        attempted.push(candidate.host().to_string());

        if !self.probe(&candidate).await {
            return None;
        }

        info!(host = candidate.host(), ?source, "backend endpoint found");
        self.remember(&candidate).await;
        Some(ResolvedEndpoint {
            base_url: candidate.base_url(),
            candidate,
            source,
            resolved_at: UnixTimeMs::now(),
        })
    }

    async fn remember(&self, candidate: &Candidate) {
        if let Err(e) = self
            .kv
            .set(StorageKey::LastWorkingIp, candidate.host().to_string())
            .await
        {
            self.metrics.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, host = candidate.host(), "failed to persist working host");
        }
    }

    /// `true` only for a 2xx answer to `GET /health` within the probe timeout.
    pub async fn probe(&self, candidate: &Candidate) -> bool {
        self.metrics.probes.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.probe_timeout();

        let request = match HttpRequest::get(candidate.health_url())
            .and_then(|r| r.with_timeout(timeout))
        {
            Ok(request) => request,
            Err(e) => {
                debug!(host = candidate.host(), error = %e, "invalid probe request");
                return false;
            }
        };

        match tokio::time::timeout(timeout, self.http.execute(request)).await {
            Ok(Ok(response)) if response.is_success() => true,
            Ok(Ok(response)) => {
                debug!(host = candidate.host(), status = response.status(), "probe rejected");
                false
            }
            Ok(Err(e)) => {
                debug!(host = candidate.host(), error = %e, "probe failed");
                false
            }
            Err(_) => {
                debug!(host = candidate.host(), "probe timed out");
                false
            }
        }
    }
}
