use std::sync::Arc;
use tracing::info;

use crate::api::{ApiClient, ApiError};
use crate::auth::AuthService;
use crate::capabilities::Capabilities;
use crate::config::{ClientConfig, ConfigError};
use crate::connectivity::ConnectionMonitor;
use crate::documents::DocumentService;
use crate::profile::ProfileService;
use crate::resolver::EndpointResolver;
use crate::session::{Session, SessionStore};

/// Everything a shell needs, wired once from its capabilities.
pub struct PortalClient {
    config: ClientConfig,
    resolver: Arc<EndpointResolver>,
    api: Arc<ApiClient>,
    session: Arc<SessionStore>,
    auth: AuthService,
    profile: ProfileService,
    documents: DocumentService,
}

impl PortalClient {
    pub fn new(caps: &Capabilities, config: ClientConfig) -> Result<Self, ConfigError> {
        let resolver = Arc::new(EndpointResolver::new(caps, config.clone())?);
        let api = Arc::new(ApiClient::new(caps, resolver.clone()));
        let session = Arc::new(SessionStore::new(caps));

        Ok(Self {
            auth: AuthService::new(api.clone(), session.clone(), config.offline_policy),
            profile: ProfileService::new(api.clone(), session.clone()),
            documents: DocumentService::new(api.clone(), session.clone()),
            config,
            resolver,
            api,
            session,
        })
    }

    /// Restores the persisted session, if any, and checks it against `/me`.
    pub async fn start(&self) -> Result<Option<Arc<Session>>, ApiError> {
        let restored = self.auth.restore_session().await?;
        info!(signed_in = restored.is_some(), "portal client started");
        Ok(restored)
    }

    /// Starts a health monitor on the configured interval. It stops when
    /// the returned handle is dropped.
    pub fn connection_monitor(&self) -> ConnectionMonitor {
        ConnectionMonitor::spawn(self.api.clone(), self.config.health_check_interval())
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<EndpointResolver> {
        &self.resolver
    }

    #[must_use]
    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    #[must_use]
    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    #[must_use]
    pub fn profile(&self) -> &ProfileService {
        &self.profile
    }

    #[must_use]
    pub fn documents(&self) -> &DocumentService {
        &self.documents
    }
}

impl std::fmt::Debug for PortalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
