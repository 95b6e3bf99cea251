use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::api::{endpoints, ApiClient, ApiError};
use crate::session::{SessionStore, UserProfile};
use crate::validation::{require, validate_email, validate_phone, ValidationError};

pub const MAX_PROFILE_PICTURE_BYTES: usize = 5 * 1024 * 1024;

const ALLOWED_PICTURE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];

/// Partial profile edit; `None` fields are left out of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parental_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parental_phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn normalized(&self) -> Self {
        let trim = |v: &Option<String>| v.as_ref().map(|s| s.trim().to_string());
        let email = |v: &Option<String>| v.as_ref().map(|s| s.trim().to_lowercase());
        Self {
            first_name: trim(&self.first_name),
            last_name: trim(&self.last_name),
            email: email(&self.email),
            parental_email: email(&self.parental_email),
            phone_number: trim(&self.phone_number),
            parental_phone_number: trim(&self.parental_phone_number),
            department: trim(&self.department),
            position: trim(&self.position),
            address: trim(&self.address),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyUpdate);
        }
        if let Some(first_name) = &self.first_name {
            require("firstName", first_name)?;
        }
        if let Some(last_name) = &self.last_name {
            require("lastName", last_name)?;
        }
        if let Some(email) = &self.email {
            validate_email("email", email)?;
        }
        if let Some(email) = &self.parental_email {
            validate_email("parentalEmail", email)?;
        }
        if let Some(phone) = &self.phone_number {
            validate_phone("phoneNumber", phone)?;
        }
        if let Some(phone) = &self.parental_phone_number {
            validate_phone("parentalPhoneNumber", phone)?;
        }
        Ok(())
    }
}

pub fn picture_data_url(image: &[u8], mime: &str) -> Result<String, ValidationError> {
    if image.is_empty() {
        return Err(ValidationError::Required { field: "imageData" });
    }
    if image.len() > MAX_PROFILE_PICTURE_BYTES {
        return Err(ValidationError::TooLarge {
            field: "imageData",
            max: MAX_PROFILE_PICTURE_BYTES,
        });
    }
    let mime = mime.trim().to_lowercase();
    if !ALLOWED_PICTURE_TYPES.contains(&mime.as_str()) {
        return Err(ValidationError::UnsupportedFormat { field: "imageData" });
    }
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(image)))
}

#[derive(Deserialize)]
struct UserEnvelope {
    #[serde(default)]
    user: Option<UserProfile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadEnvelope {
    #[serde(default)]
    profile_picture: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest<'a> {
    image_data: &'a str,
}

pub struct ProfileService {
    api: Arc<ApiClient>,
    session: Arc<SessionStore>,
}

impl ProfileService {
    pub fn new(api: Arc<ApiClient>, session: Arc<SessionStore>) -> Self {
        Self { api, session }
    }

    #[instrument(skip(self))]
    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        let session = self.session.require().await?;
        let result: Result<UserEnvelope, ApiError> =
            self.api.get(endpoints::ME, Some(session.token())).await;
        let envelope = self.session.guard(result).await?;

        let user = envelope.user.ok_or_else(|| ApiError::MalformedResponse {
            reason: "profile response carried no user".into(),
        })?;
        let updated = self.session.update_user(user).await?;
        Ok(updated.user().clone())
    }

    #[instrument(skip(self, update))]
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, ApiError> {
        let update = update.normalized();
        update.validate()?;
        let session = self.session.require().await?;

        let result: Result<UserEnvelope, ApiError> = self
            .api
            .send(endpoints::UPDATE_PROFILE, Some(&update), Some(session.token()))
            .await;
        let envelope = self.session.guard(result).await?;

        // Servers that answer without the user still applied the edit.
        let user = envelope
            .user
            .unwrap_or_else(|| apply_update(session.user().clone(), &update));
        let updated = self.session.update_user(user).await?;
        info!(user_id = updated.user_id(), "profile updated");
        Ok(updated.user().clone())
    }

    /// Uploads `image` as a base64 data URL and returns the stored picture.
    #[instrument(skip(self, image), fields(size = image.len()))]
    pub async fn upload_profile_picture(
        &self,
        image: &[u8],
        mime: &str,
    ) -> Result<String, ApiError> {
        let data_url = picture_data_url(image, mime)?;
        let session = self.session.require().await?;

        let body = UploadRequest {
            image_data: &data_url,
        };
        let result: Result<UploadEnvelope, ApiError> = self
            .api
            .send(endpoints::UPLOAD_PROFILE_PICTURE, Some(&body), Some(session.token()))
            .await;
        let envelope = self.session.guard(result).await?;

        let picture = envelope.profile_picture.unwrap_or(data_url);
        let user = UserProfile {
            profile_picture: Some(picture.clone()),
            ..session.user().clone()
        };
        self.session.update_user(user).await?;
        Ok(picture)
    }
}

fn apply_update(mut user: UserProfile, update: &ProfileUpdate) -> UserProfile {
    if let Some(v) = &update.first_name {
        user.first_name = v.clone();
    }
    if let Some(v) = &update.last_name {
        user.last_name = v.clone();
    }
    if let Some(v) = &update.email {
        user.email = v.clone();
    }
    let optional = [
        (&mut user.parental_email, &update.parental_email),
        (&mut user.phone_number, &update.phone_number),
        (&mut user.parental_phone_number, &update.parental_phone_number),
        (&mut user.department, &update.department),
        (&mut user.position, &update.position),
        (&mut user.address, &update.address),
    ];
    for (field, value) in optional {
        if value.is_some() {
            *field = value.clone();
        }
    }
    user
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{json_response, mock_capabilities, MockHttpShell};
    use crate::capabilities::HttpMethod;
    use crate::config::ClientConfig;
    use crate::resolver::EndpointResolver;
    use secrecy::SecretString;

    async fn service(
        shell: MockHttpShell,
    ) -> (ProfileService, Arc<SessionStore>, Arc<MockHttpShell>) {
        let (caps, http, _) = mock_capabilities(shell);
        let config = ClientConfig {
            candidate_hosts: vec!["localhost".into()],
            ..ClientConfig::default()
        };
        let resolver = Arc::new(EndpointResolver::new(&caps, config).unwrap());
        let api = Arc::new(ApiClient::new(&caps, resolver));
        let session = Arc::new(SessionStore::new(&caps));
        session
            .save(
                SecretString::new("jwt".into()),
                UserProfile {
                    id: "u1".into(),
                    first_name: "Amina".into(),
                    email: "amina@leoni.com".into(),
                    department: Some("RH".into()),
                    ..UserProfile::default()
                },
            )
            .await
            .unwrap();
        (ProfileService::new(api, session.clone()), session, http)
    }

    #[test]
    fn test_update_serializes_only_present_fields() {
        let update = ProfileUpdate {
            phone_number: Some(" +216 22 333 444 ".into()),
            ..ProfileUpdate::default()
        }
        .normalized();
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({"phoneNumber": "+216 22 333 444"}));
    }

    #[test]
    fn test_update_validation() {
        assert_eq!(
            ProfileUpdate::default().validate(),
            Err(ValidationError::EmptyUpdate)
        );
        let bad_email = ProfileUpdate {
            email: Some("nope".into()),
            ..ProfileUpdate::default()
        };
        assert_eq!(
            bad_email.validate(),
            Err(ValidationError::InvalidEmail { field: "email" })
        );
        let blank_name = ProfileUpdate {
            first_name: Some("".into()),
            ..ProfileUpdate::default()
        };
        assert_eq!(
            blank_name.validate(),
            Err(ValidationError::Required { field: "firstName" })
        );
    }

    #[test]
    fn test_picture_data_url() {
        assert_eq!(
            picture_data_url(&[0xff, 0xd8, 0xff], "image/jpeg").unwrap(),
            "data:image/jpeg;base64,/9j/"
        );
        assert!(picture_data_url(&[], "image/png").is_err());
        assert!(picture_data_url(&[1, 2, 3], "application/pdf").is_err());
        assert_eq!(
            picture_data_url(&vec![0u8; MAX_PROFILE_PICTURE_BYTES + 1], "image/png"),
            Err(ValidationError::TooLarge {
                field: "imageData",
                max: MAX_PROFILE_PICTURE_BYTES
            })
        );
    }

    #[tokio::test]
    async fn test_update_profile_refreshes_local_user() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_with(HttpMethod::Put, "/update-profile", |request| {
            assert_eq!(request.header("authorization"), Some("Bearer jwt"));
            Ok(json_response(200, &serde_json::json!({"success": true})))
        });
        let (profiles, session, _) = service(shell).await;

        let user = profiles
            .update_profile(&ProfileUpdate {
                address: Some("Sousse".into()),
                ..ProfileUpdate::default()
            })
            .await
            .unwrap();

        assert_eq!(user.address.as_deref(), Some("Sousse"));
        assert_eq!(user.department.as_deref(), Some("RH"));
        let current = session.current().await.unwrap();
        assert_eq!(current.user().address.as_deref(), Some("Sousse"));
    }

    #[tokio::test]
    async fn test_invalid_update_never_hits_network() {
        let (profiles, _, http) =
            service(MockHttpShell::new().with_reachable_host("localhost")).await;

        let result = profiles
            .update_profile(&ProfileUpdate {
                phone_number: Some("abc".into()),
                ..ProfileUpdate::default()
            })
            .await;

        assert!(matches!(result, Err(ApiError::Validation(_))));
        assert_eq!(http.count(HttpMethod::Put, "/update-profile"), 0);
    }

    #[tokio::test]
    async fn test_cleared_department_is_stored() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_with(HttpMethod::Put, "/update-profile", |request| {
            let body: serde_json::Value = serde_json::from_slice(request.body().unwrap()).unwrap();
            assert_eq!(body["department"], "");
            Ok(json_response(
                200,
                &serde_json::json!({"success": true, "user": {
                    "_id": "u1",
                    "firstName": "Amina",
                    "email": "amina@leoni.com",
                    "department": ""
                }}),
            ))
        });
        let (profiles, session, _) = service(shell).await;

        let user = profiles
            .update_profile(&ProfileUpdate {
                department: Some("  ".into()),
                ..ProfileUpdate::default()
            })
            .await
            .unwrap();

        assert_eq!(user.department.as_deref(), Some(""));
        let current = session.current().await.unwrap();
        assert_eq!(current.user().department.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_fetch_profile_unauthorized_tears_down_session() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_json(
            HttpMethod::Get,
            "/me",
            401,
            serde_json::json!({"success": false, "message": "Token expiré"}),
        );
        let (profiles, session, _) = service(shell).await;

        assert_eq!(
            profiles.fetch_profile().await.unwrap_err(),
            ApiError::AuthRequired
        );
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_upload_profile_picture() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_with(HttpMethod::Post, "/upload-profile-picture", |request| {
            let body: serde_json::Value = serde_json::from_slice(request.body().unwrap()).unwrap();
            assert_eq!(body["imageData"], "data:image/png;base64,AQID");
            Ok(json_response(200, &serde_json::json!({"success": true})))
        });
        let (profiles, session, _) = service(shell).await;

        let picture = profiles
            .upload_profile_picture(&[1, 2, 3], "image/png")
            .await
            .unwrap();

        assert_eq!(picture, "data:image/png;base64,AQID");
        let current = session.current().await.unwrap();
        assert_eq!(current.user().profile_picture.as_deref(), Some(picture.as_str()));
    }
}
