use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::api::ApiError;
use crate::capabilities::{
    load_json, store_json, Capabilities, KeyValueStore, KvError, StorageKey,
};

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parental_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parental_phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

// Contact details and the (possibly multi-megabyte) picture stay out of logs.
impl std::fmt::Debug for UserProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserProfile")
            .field("id", &self.id)
            .field("employee_id", &self.employee_id)
            .field("has_profile_picture", &self.profile_picture.is_some())
            .finish_non_exhaustive()
    }
}

// Only an omitted field falls back; an empty string is a value the server holds.
fn keep_existing(incoming: Option<String>, existing: &Option<String>) -> Option<String> {
    incoming.or_else(|| existing.clone())
}

fn keep_existing_required(incoming: String, existing: &str) -> String {
    if incoming.trim().is_empty() {
        existing.to_string()
    } else {
        incoming
    }
}

impl UserProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Optional fields the server omitted are filled from `existing`. The
    /// server's value wins whenever it sent one, even an empty one.
    #[must_use]
    pub fn merged_over(self, existing: &UserProfile) -> UserProfile {
        UserProfile {
            id: keep_existing_required(self.id, &existing.id),
            first_name: keep_existing_required(self.first_name, &existing.first_name),
            last_name: keep_existing_required(self.last_name, &existing.last_name),
            email: keep_existing_required(self.email, &existing.email),
            parental_email: keep_existing(self.parental_email, &existing.parental_email),
            phone_number: keep_existing(self.phone_number, &existing.phone_number),
            parental_phone_number: keep_existing(
                self.parental_phone_number,
                &existing.parental_phone_number,
            ),
            employee_id: keep_existing(self.employee_id, &existing.employee_id),
            department: keep_existing(self.department, &existing.department),
            position: keep_existing(self.position, &existing.position),
            address: keep_existing(self.address, &existing.address),
            profile_picture: keep_existing(self.profile_picture, &existing.profile_picture),
        }
    }
}

/// An authenticated user. The token never appears in `Debug` output.
pub struct Session {
    token: SecretString,
    user: UserProfile,
}

impl Session {
    pub fn new(token: SecretString, user: UserProfile) -> Self {
        Self { token, user }
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"[REDACTED]")
            .field("user", &self.user)
            .finish()
    }
}

/// In-memory session mirrored to `userToken` / `userData`.
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    current: RwLock<Option<Arc<Session>>>,
    epoch: AtomicU64,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(caps: &Capabilities) -> Self {
        Self {
            kv: caps.kv.clone(),
            current: RwLock::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Loads the persisted session. Both the token and the user must be
    /// present; a half-written pair counts as logged out.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<Option<Arc<Session>>, KvError> {
        let token = self.kv.get(StorageKey::UserToken).await?;
        let user = match load_json::<UserProfile>(self.kv.as_ref(), StorageKey::UserData).await {
            Ok(user) => user,
            Err(KvError::Serialization { message, .. }) => {
                warn!(error = %message, "discarding unreadable stored user");
                None
            }
            Err(e) => return Err(e),
        };

        let session = match (token, user) {
            (Some(token), Some(user)) if !token.is_empty() => {
                Some(Arc::new(Session::new(SecretString::new(token), user)))
            }
            _ => None,
        };

        debug!(restored = session.is_some(), "session restore finished");
        *self.current.write().await = session.clone();
        Ok(session)
    }

    #[instrument(skip(self, token, user))]
    pub async fn save(
        &self,
        token: SecretString,
        user: UserProfile,
    ) -> Result<Arc<Session>, KvError> {
        let merged = match self.existing_user().await {
            Some(existing) if existing.id == user.id || user.id.is_empty() => {
                user.merged_over(&existing)
            }
            _ => user,
        };

        self.kv
            .set(StorageKey::UserToken, token.expose_secret().clone())
            .await?;
        store_json(self.kv.as_ref(), StorageKey::UserData, &merged).await?;

        let session = Arc::new(Session::new(token, merged));
        let previous = self.current.write().await.replace(session.clone());
        if previous.is_some_and(|p| p.user_id() != session.user_id()) {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        info!(user_id = session.user_id(), "session saved");
        Ok(session)
    }

    /// Replaces the user of the current session, keeping the token.
    pub async fn update_user(&self, user: UserProfile) -> Result<Arc<Session>, ApiError> {
        let session = self.require().await?;
        let merged = user.merged_over(session.user());
        store_json(self.kv.as_ref(), StorageKey::UserData, &merged).await?;

        let token = SecretString::new(session.token().expose_secret().clone());
        let updated = Arc::new(Session::new(token, merged));
        *self.current.write().await = Some(updated.clone());
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), KvError> {
        *self.current.write().await = None;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.kv
            .remove_many(&[StorageKey::UserToken, StorageKey::UserData])
            .await?;
        info!("session cleared");
        Ok(())
    }

    /// Changes whenever the session is torn down or another user signs in.
    /// State cached per user is stale once this moves.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        self.current.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn require(&self) -> Result<Arc<Session>, ApiError> {
        self.current().await.ok_or(ApiError::AuthRequired)
    }

    /// Passes `result` through; an `AuthRequired` first tears the session down.
    pub async fn guard<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if matches!(result, Err(ApiError::AuthRequired)) && self.is_authenticated().await {
            warn!("server rejected session, logging out");
            if let Err(e) = self.clear().await {
                warn!(error = %e, "failed to clear rejected session");
            }
        }
        result
    }

    async fn existing_user(&self) -> Option<UserProfile> {
        if let Some(session) = self.current().await {
            return Some(session.user().clone());
        }
        match load_json::<UserProfile>(self.kv.as_ref(), StorageKey::UserData).await {
            Ok(user) => user,
            Err(e) => {
                debug!(error = %e, "no usable stored user to merge");
                None
            }
        }
    }
}
