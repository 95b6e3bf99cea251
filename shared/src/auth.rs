use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::api::{endpoints, ApiClient, ApiError};
use crate::config::OfflinePolicy;
use crate::session::{Session, SessionStore, UserProfile};
use crate::validation::{
    normalize_email, require, validate_email, validate_password, validate_phone, ValidationError,
};

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: String,
    user: UserProfile,
}

#[derive(Deserialize)]
struct UserResponse {
    user: UserProfile,
}

#[derive(Deserialize)]
struct MessageResponse {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: String,
    password: &'a str,
}

#[derive(Serialize)]
struct EmailRequest {
    email: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetPasswordRequest<'a> {
    token: &'a str,
    new_password: &'a str,
}

/// Sign-up form as the screen collects it.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub parental_email: String,
    pub phone_number: String,
    pub parental_phone_number: String,
    pub password: String,
    pub confirm_password: String,
}

impl std::fmt::Debug for RegistrationForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationForm")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .finish_non_exhaustive()
    }
}

impl RegistrationForm {
    /// Trimmed copy with lowercased emails; passwords are left untouched.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            email: normalize_email(&self.email),
            parental_email: normalize_email(&self.parental_email),
            phone_number: self.phone_number.trim().to_string(),
            parental_phone_number: self.parental_phone_number.trim().to_string(),
            password: self.password.clone(),
            confirm_password: self.confirm_password.clone(),
        }
    }

    /// Same rules and order as the backend's `/register` checks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("firstName", &self.first_name)?;
        require("lastName", &self.last_name)?;
        require("email", &self.email)?;
        require("parentalEmail", &self.parental_email)?;
        require("phoneNumber", &self.phone_number)?;
        require("parentalPhoneNumber", &self.parental_phone_number)?;
        require("password", &self.password)?;
        require("confirmPassword", &self.confirm_password)?;

        validate_email("email", &self.email)?;
        validate_email("parentalEmail", &self.parental_email)?;
        if normalize_email(&self.email) == normalize_email(&self.parental_email) {
            return Err(ValidationError::EmailsMustDiffer);
        }

        validate_phone("phoneNumber", &self.phone_number)?;
        validate_phone("parentalPhoneNumber", &self.parental_phone_number)?;

        if self.password != self.confirm_password {
            return Err(ValidationError::PasswordMismatch);
        }
        validate_password(&self.password)
    }
}

pub struct AuthService {
    api: Arc<ApiClient>,
    session: Arc<SessionStore>,
    offline_policy: OfflinePolicy,
}

impl AuthService {
    pub fn new(
        api: Arc<ApiClient>,
        session: Arc<SessionStore>,
        offline_policy: OfflinePolicy,
    ) -> Self {
        Self {
            api,
            session,
            offline_policy,
        }
    }

    #[instrument(skip(self, email, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<Arc<Session>, ApiError> {
        validate_email("email", email)?;
        if password.is_empty() {
            return Err(ValidationError::Required { field: "password" }.into());
        }

        let body = LoginRequest {
            email: normalize_email(email),
            password,
        };
        let response: AuthResponse = self.api.send(endpoints::LOGIN, Some(&body), None).await?;
        self.establish(response).await
    }

    #[instrument(skip(self, form))]
    pub async fn register(&self, form: &RegistrationForm) -> Result<Arc<Session>, ApiError> {
        let form = form.normalized();
        form.validate()?;

        let response: AuthResponse = self
            .api
            .send(endpoints::REGISTER, Some(&form), None)
            .await?;
        self.establish(response).await
    }

    async fn establish(&self, response: AuthResponse) -> Result<Arc<Session>, ApiError> {
        if response.token.is_empty() {
            return Err(ApiError::MalformedResponse {
                reason: "authentication response carried no token".into(),
            });
        }
        let session = self
            .session
            .save(SecretString::new(response.token), response.user)
            .await?;
        info!(user_id = session.user_id(), "signed in");
        Ok(session)
    }

    /// Restores the persisted session and confirms it with the server.
    ///
    /// `Ok(None)` means the user must sign in. When the server cannot be
    /// reached the [`OfflinePolicy`] decides whether the stored session is
    /// trusted.
    #[instrument(skip(self))]
    pub async fn restore_session(&self) -> Result<Option<Arc<Session>>, ApiError> {
        let Some(session) = self.session.restore().await? else {
            return Ok(None);
        };

        let result: Result<UserResponse, ApiError> =
            self.api.get(endpoints::ME, Some(session.token())).await;

        match result {
            Ok(response) => Ok(Some(self.session.update_user(response.user).await?)),
            Err(ApiError::AuthRequired)
            | Err(ApiError::ServerError {
                status: 403 | 404, ..
            }) => {
                warn!("stored session rejected by server");
                self.session.clear().await?;
                Ok(None)
            }
            Err(e) if e.is_offline() => match self.offline_policy {
                OfflinePolicy::TrustCachedSession => {
                    warn!(error = %e, "server unreachable, keeping stored session");
                    Ok(Some(session))
                }
                OfflinePolicy::FailClosed => {
                    warn!(error = %e, "server unreachable, session not trusted");
                    self.session.clear().await?;
                    Ok(None)
                }
            },
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<(), ApiError> {
        self.session.clear().await?;
        Ok(())
    }

    pub async fn current_session(&self) -> Option<Arc<Session>> {
        self.session.current().await
    }

    /// Returns the server's confirmation message.
    #[instrument(skip(self, email))]
    pub async fn request_password_reset(&self, email: &str) -> Result<String, ApiError> {
        validate_email("email", email)?;
        let body = EmailRequest {
            email: normalize_email(email),
        };
        let response: MessageResponse = self
            .api
            .send(endpoints::FORGOT_PASSWORD, Some(&body), None)
            .await?;
        Ok(response.message.unwrap_or_default())
    }

    #[instrument(skip(self, reset_token, new_password))]
    pub async fn reset_password(
        &self,
        reset_token: &SecretString,
        new_password: &str,
    ) -> Result<String, ApiError> {
        require("token", reset_token.expose_secret())?;
        validate_password(new_password)?;

        let body = ResetPasswordRequest {
            token: reset_token.expose_secret().trim(),
            new_password,
        };
        let response: MessageResponse = self
            .api
            .send(endpoints::RESET_PASSWORD, Some(&body), None)
            .await?;
        Ok(response.message.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{json_response, mock_capabilities, MockHttpShell};
    use crate::capabilities::{HttpMethod, KeyValueStore, StorageKey};
    use crate::config::ClientConfig;
    use crate::resolver::EndpointResolver;

    struct Harness {
        auth: AuthService,
        session: Arc<SessionStore>,
        http: Arc<MockHttpShell>,
        kv: Arc<crate::capabilities::MemoryKvStore>,
    }

    fn harness(shell: MockHttpShell, policy: OfflinePolicy) -> Harness {
        let (caps, http, kv) = mock_capabilities(shell);
        let config = ClientConfig {
            candidate_hosts: vec!["localhost".into()],
            ..ClientConfig::default()
        };
        let resolver = Arc::new(EndpointResolver::new(&caps, config).unwrap());
        let api = Arc::new(ApiClient::new(&caps, resolver));
        let session = Arc::new(SessionStore::new(&caps));
        Harness {
            auth: AuthService::new(api, session.clone(), policy),
            session,
            http,
            kv,
        }
    }

    fn auth_body() -> serde_json::Value {
        serde_json::json!({
            "success": true,
            "token": "jwt-1",
            "user": {"id": "u1", "firstName": "Amina", "lastName": "Ben Salah",
                     "email": "amina@leoni.com", "employeeId": "EMP001"}
        })
    }

    fn valid_form() -> RegistrationForm {
        RegistrationForm {
            first_name: " Amina ".into(),
            last_name: "Ben Salah".into(),
            email: "Amina@Leoni.com".into(),
            parental_email: "parent@leoni.com".into(),
            phone_number: "+216 22 333 444".into(),
            parental_phone_number: "+216 98 765 432".into(),
            password: "secret1".into(),
            confirm_password: "secret1".into(),
        }
    }

    #[test]
    fn test_registration_rules() {
        assert!(valid_form().normalized().validate().is_ok());

        let mut form = valid_form();
        form.parental_email = "AMINA@leoni.com".into();
        assert_eq!(form.validate(), Err(ValidationError::EmailsMustDiffer));

        let mut form = valid_form();
        form.confirm_password = "secret2".into();
        assert_eq!(form.validate(), Err(ValidationError::PasswordMismatch));

        let mut form = valid_form();
        form.password = "abc".into();
        form.confirm_password = "abc".into();
        assert_eq!(
            form.validate(),
            Err(ValidationError::PasswordTooShort { min: 6 })
        );

        let mut form = valid_form();
        form.phone_number = "12".into();
        assert_eq!(
            form.validate(),
            Err(ValidationError::InvalidPhone {
                field: "phoneNumber"
            })
        );

        let mut form = valid_form();
        form.last_name = "  ".into();
        assert_eq!(
            form.validate(),
            Err(ValidationError::Required { field: "lastName" })
        );
    }

    #[tokio::test]
    async fn test_login_normalizes_email_and_saves_session() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_with(HttpMethod::Post, "/login", |request| {
            let body: serde_json::Value = serde_json::from_slice(request.body().unwrap()).unwrap();
            assert_eq!(body["email"], "amina@leoni.com");
            assert_eq!(body["password"], "pw");
            Ok(json_response(200, &auth_body()))
        });
        let h = harness(shell, OfflinePolicy::default());

        let session = h.auth.login("  Amina@Leoni.COM ", "pw").await.unwrap();

        assert_eq!(session.token().expose_secret(), "jwt-1");
        assert_eq!(
            h.kv.get(StorageKey::UserToken).await.unwrap().as_deref(),
            Some("jwt-1")
        );
    }

    #[tokio::test]
    async fn test_login_validation_blocks_network() {
        let h = harness(
            MockHttpShell::new().with_reachable_host("localhost"),
            OfflinePolicy::default(),
        );

        let result = h.auth.login("not-an-email", "pw").await;

        assert_eq!(
            result.unwrap_err(),
            ApiError::Validation(ValidationError::InvalidEmail { field: "email" })
        );
        assert!(h.http.requests().is_empty());
    }

    #[tokio::test]
    async fn test_login_rejected_credentials() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_json(
            HttpMethod::Post,
            "/login",
            401,
            serde_json::json!({"success": false, "message": "Email ou mot de passe incorrect"}),
        );
        let h = harness(shell, OfflinePolicy::default());

        let result = h.auth.login("amina@leoni.com", "wrong").await;

        assert_eq!(
            result.unwrap_err(),
            ApiError::ServerError {
                status: 401,
                message: "Email ou mot de passe incorrect".into()
            }
        );
        assert!(!h.session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_register_posts_normalized_form() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_with(HttpMethod::Post, "/register", |request| {
            let body: serde_json::Value = serde_json::from_slice(request.body().unwrap()).unwrap();
            assert_eq!(body["firstName"], "Amina");
            assert_eq!(body["email"], "amina@leoni.com");
            assert_eq!(body["confirmPassword"], "secret1");
            Ok(json_response(201, &auth_body()))
        });
        let h = harness(shell, OfflinePolicy::default());

        let session = h.auth.register(&valid_form()).await.unwrap();
        assert_eq!(session.user().employee_id.as_deref(), Some("EMP001"));
    }

    #[tokio::test]
    async fn test_missing_token_is_malformed() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_json(
            HttpMethod::Post,
            "/login",
            200,
            serde_json::json!({"success": true, "user": {"id": "u1"}}),
        );
        let h = harness(shell, OfflinePolicy::default());

        assert!(matches!(
            h.auth.login("amina@leoni.com", "pw").await,
            Err(ApiError::MalformedResponse { .. })
        ));
    }

    async fn seed_session(h: &Harness) {
        h.session
            .save(
                SecretString::new("jwt-1".into()),
                UserProfile {
                    id: "u1".into(),
                    email: "amina@leoni.com".into(),
                    address: Some("Sousse".into()),
                    ..UserProfile::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restore_session_refreshes_user() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_json(
            HttpMethod::Get,
            "/me",
            200,
            serde_json::json!({"success": true, "user": {
                "_id": "u1",
                "email": "amina@leoni.com",
                "department": "RH"
            }}),
        );
        let h = harness(shell, OfflinePolicy::default());
        seed_session(&h).await;

        let session = h.auth.restore_session().await.unwrap().unwrap();

        assert_eq!(session.user().department.as_deref(), Some("RH"));
        assert_eq!(session.user().address.as_deref(), Some("Sousse"));
    }

    #[tokio::test]
    async fn test_restore_session_rejected_token_logs_out() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_json(
            HttpMethod::Get,
            "/me",
            401,
            serde_json::json!({"success": false, "message": "Token invalide"}),
        );
        let h = harness(shell, OfflinePolicy::default());
        seed_session(&h).await;

        assert!(h.auth.restore_session().await.unwrap().is_none());
        assert_eq!(h.kv.get(StorageKey::UserToken).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_restore_session_offline_policies() {
        let trusting = harness(MockHttpShell::new(), OfflinePolicy::TrustCachedSession);
        seed_session(&trusting).await;
        let kept = trusting.auth.restore_session().await.unwrap();
        assert_eq!(kept.unwrap().user_id(), "u1");

        let strict = harness(MockHttpShell::new(), OfflinePolicy::FailClosed);
        seed_session(&strict).await;
        assert!(strict.auth.restore_session().await.unwrap().is_none());
        assert!(!strict.session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_password_reset_flow() {
        let shell = MockHttpShell::new().with_reachable_host("localhost");
        shell.respond_json(
            HttpMethod::Post,
            "/forgot-password",
            200,
            serde_json::json!({"success": true, "message": "Email envoyé"}),
        );
        shell.respond_with(HttpMethod::Post, "/reset-password", |request| {
            let body: serde_json::Value = serde_json::from_slice(request.body().unwrap()).unwrap();
            assert_eq!(body["token"], "reset-abc");
            assert_eq!(body["newPassword"], "newpass");
            Ok(json_response(
                200,
                &serde_json::json!({"success": true, "message": "Mot de passe réinitialisé"}),
            ))
        });
        let h = harness(shell, OfflinePolicy::default());

        assert_eq!(
            h.auth.request_password_reset("amina@leoni.com").await.unwrap(),
            "Email envoyé"
        );
        assert_eq!(
            h.auth
                .reset_password(&SecretString::new("reset-abc".into()), "newpass")
                .await
                .unwrap(),
            "Mot de passe réinitialisé"
        );
        assert_eq!(
            h.auth
                .reset_password(&SecretString::new("reset-abc".into()), "123")
                .await
                .unwrap_err(),
            ApiError::Validation(ValidationError::PasswordTooShort { min: 6 })
        );
    }
}
