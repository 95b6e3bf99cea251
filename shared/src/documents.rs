use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::api::{endpoints, ApiClient, ApiError};
use crate::session::SessionStore;
use crate::status::{Stage, StatusState, StatusTracker};
use crate::validation::{require, ValidationError};

/// Types offered by the request form. The backend accepts any non-empty type.
pub const DOCUMENT_TYPES: &[&str] = &[
    "Certificat de travail",
    "Attestation de salaire",
    "Relevé de compte",
    "Certificat médical",
    "Attestation de formation",
    "Autre",
];

pub const MAX_DESCRIPTION_LENGTH: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentRecord {
    #[serde(default, alias = "_id")]
    id: Option<String>,
    document_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Deserialize)]
struct SubmitEnvelope {
    #[serde(default)]
    request: Option<DocumentRecord>,
}

#[derive(Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    requests: Vec<DocumentRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    user_id: &'a str,
    document_type: &'a str,
    description: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequest {
    /// Absent when the server acknowledged a submission without echoing it.
    pub id: Option<String>,
    pub document_type: String,
    pub description: String,
    /// ISO-8601 as sent by the server.
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    /// Raw server label, kept even when it is not a known stage.
    pub server_status: Option<String>,
    pub status: StatusState,
}

#[derive(Default)]
struct TrackedRequest {
    tracker: StatusTracker,
    /// Last stage taken from the server; `None` until a listing mentions it.
    applied: Option<Stage>,
}

/// Trackers of the signed-in user, keyed by request id.
#[derive(Default)]
struct Trackers {
    epoch: u64,
    requests: HashMap<String, TrackedRequest>,
}

pub struct DocumentService {
    api: Arc<ApiClient>,
    session: Arc<SessionStore>,
    trackers: Mutex<Trackers>,
}

impl DocumentService {
    pub fn new(api: Arc<ApiClient>, session: Arc<SessionStore>) -> Self {
        let trackers = Trackers {
            epoch: session.epoch(),
            ..Trackers::default()
        };
        Self {
            api,
            session,
            trackers: Mutex::new(trackers),
        }
    }

    /// Trackers for the current session; those of an ended session are dropped.
    async fn trackers(&self) -> MutexGuard<'_, Trackers> {
        let mut trackers = self.trackers.lock().await;
        let epoch = self.session.epoch();
        if trackers.epoch != epoch {
            if !trackers.requests.is_empty() {
                debug!(count = trackers.requests.len(), "dropping trackers of ended session");
            }
            trackers.requests.clear();
            trackers.epoch = epoch;
        }
        trackers
    }

    #[instrument(skip(self, description))]
    pub async fn submit(
        &self,
        document_type: &str,
        description: &str,
    ) -> Result<DocumentRequest, ApiError> {
        let document_type = document_type.trim();
        let description = description.trim();
        require("documentType", document_type)?;
        if description.chars().count() > MAX_DESCRIPTION_LENGTH {
            return Err(ValidationError::TooLarge {
                field: "description",
                max: MAX_DESCRIPTION_LENGTH,
            }
            .into());
        }

        let session = self.session.require().await?;
        if session.user_id().is_empty() {
            return Err(ValidationError::Required { field: "userId" }.into());
        }

        let body = SubmitBody {
            user_id: session.user_id(),
            document_type,
            description,
        };
        let result: Result<SubmitEnvelope, ApiError> = self
            .api
            .send(endpoints::DOCUMENT_REQUEST, Some(&body), Some(session.token()))
            .await;
        let envelope = self.session.guard(result).await?;

        let request = match envelope.request {
            Some(record) => self.track(record).await,
            None => {
                debug!("submission acknowledged without a request record");
                let mut tracker = StatusTracker::new();
                tracker.apply_stage(Stage::Pending);
                DocumentRequest {
                    id: None,
                    document_type: document_type.to_string(),
                    description: description.to_string(),
                    created_at: None,
                    updated_at: None,
                    server_status: None,
                    status: tracker.snapshot(),
                }
            }
        };
        info!(id = ?request.id, "document request submitted");
        Ok(request)
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<DocumentRequest>, ApiError> {
        let session = self.session.require().await?;
        let result: Result<ListEnvelope, ApiError> = self
            .api
            .get(endpoints::DOCUMENT_REQUESTS, Some(session.token()))
            .await;
        let envelope = self.session.guard(result).await?;

        let mut requests = Vec::with_capacity(envelope.requests.len());
        for record in envelope.requests {
            requests.push(self.track(record).await);
        }

        let listed: HashSet<&str> = requests.iter().filter_map(|r| r.id.as_deref()).collect();
        let mut trackers = self.trackers().await;
        let before = trackers.requests.len();
        trackers.requests.retain(|id, _| listed.contains(id.as_str()));
        debug!(
            count = requests.len(),
            pruned = before - trackers.requests.len(),
            "document requests loaded"
        );
        Ok(requests)
    }

    /// Status changes for one request, delivered as the list is refreshed.
    /// The channel closes when the request leaves the list or the session ends.
    pub async fn subscribe(&self, request_id: &str) -> broadcast::Receiver<StatusState> {
        self.trackers()
            .await
            .requests
            .entry(request_id.to_string())
            .or_default()
            .tracker
            .subscribe()
    }

    pub async fn status(&self, request_id: &str) -> Option<StatusState> {
        self.trackers()
            .await
            .requests
            .get(request_id)
            .map(|tracked| tracked.tracker.snapshot())
    }

    /// Applies the server label to the request's tracker. Subscribers only
    /// hear about actual stage changes.
    async fn track(&self, record: DocumentRecord) -> DocumentRequest {
        let stage = record.status.as_deref().and_then(Stage::from_label);
        if stage.is_none() {
            if let Some(label) = &record.status {
                warn!(label = %label, "unknown document status from server");
            }
        }

        let status = match &record.id {
            Some(id) => {
                let mut trackers = self.trackers().await;
                let tracked = trackers.requests.entry(id.clone()).or_default();
                if let Some(stage) = stage {
                    if tracked.applied != Some(stage) {
                        tracked.tracker.apply_stage(stage);
                        tracked.applied = Some(stage);
                    }
                }
                tracked.tracker.snapshot()
            }
            None => {
                let mut tracker = StatusTracker::new();
                if let Some(stage) = stage {
                    tracker.apply_stage(stage);
                }
                tracker.snapshot()
            }
        };

        DocumentRequest {
            id: record.id,
            document_type: record.document_type,
            description: record.description.unwrap_or_default(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            server_status: record.status,
            status,
        }
    }
}
