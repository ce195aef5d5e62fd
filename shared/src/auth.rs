use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::capabilities::KvError;
use crate::model::{AuthPayload, User};
use crate::pipeline::{ApiClient, ApiError, ApiRequest};
use crate::{AppError, ErrorKind};

pub const MIN_PASSWORD_LENGTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] KvError),
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Invalid(message) => AppError::new(ErrorKind::Validation, message),
            AuthError::Api(inner) => inner.into(),
            AuthError::Storage(inner) => inner.into(),
        }
    }
}

/// How a user proves who they are.
pub enum LoginMethod {
    Password(SecretString),
    /// One-time SMS code from [`AuthService::send_code`].
    Code(String),
}

pub struct Registration {
    pub phone: String,
    pub password: SecretString,
    pub code: String,
    pub nickname: Option<String>,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    phone: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    phone: &'a str,
    password: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    nickname: Option<&'a str>,
}

#[derive(Clone, Debug)]
pub struct AuthService {
    api: Arc<ApiClient>,
}

impl AuthService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    #[instrument(skip(self, phone))]
    pub async fn send_code(&self, phone: &str) -> Result<(), AuthError> {
        let phone = normalize_phone(phone)?;
        self.api
            .send_unit(ApiRequest::post("/auth/send-code").json(&serde_json::json!({ "phone": phone }))?)
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn login(&self, phone: &str, method: &LoginMethod) -> Result<User, AuthError> {
        let phone = normalize_phone(phone)?;
        let body = match method {
            LoginMethod::Password(password) => {
                if password.expose_secret().is_empty() {
                    return Err(AuthError::Invalid("password is required".into()));
                }
                LoginBody {
                    phone: &phone,
                    password: Some(password.expose_secret().as_str()),
                    code: None,
                }
            }
            LoginMethod::Code(code) => {
                if code.trim().is_empty() {
                    return Err(AuthError::Invalid("verification code is required".into()));
                }
                LoginBody {
                    phone: &phone,
                    password: None,
                    code: Some(code.trim()),
                }
            }
        };
        let payload: AuthPayload = self
            .api
            .send(ApiRequest::post("/auth/login").json(&body)?)
            .await?;
        Ok(self.establish(payload).await)
    }

    #[instrument(skip_all)]
    pub async fn register(&self, registration: &Registration) -> Result<User, AuthError> {
        let phone = normalize_phone(&registration.phone)?;
        if registration.password.expose_secret().chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::Invalid(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }
        if registration.code.trim().is_empty() {
            return Err(AuthError::Invalid("verification code is required".into()));
        }
        let body = RegisterBody {
            phone: &phone,
            password: registration.password.expose_secret().as_str(),
            code: registration.code.trim(),
            nickname: registration
                .nickname
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty()),
        };
        let payload: AuthPayload = self
            .api
            .send(ApiRequest::post("/auth/register").json(&body)?)
            .await?;
        Ok(self.establish(payload).await)
    }

    /// Tells the backend, then clears the session whatever it answered.
    /// Watchers of the session (the realtime channel among them) see the
    /// sign-out and shut down.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        let session = self.api.session();
        if session.is_authenticated() {
            if let Err(e) = self.api.send_unit(ApiRequest::post("/auth/logout")).await {
                warn!(error = %e, "Logout request failed; clearing session anyway");
            }
        }
        session.sign_out().await;
    }

    /// Restores a persisted session. `None` when there was nothing to restore.
    pub async fn restore(&self) -> Result<Option<User>, AuthError> {
        let session = self.api.session();
        if session.restore().await? {
            Ok(session.current_user())
        } else {
            Ok(None)
        }
    }

    async fn establish(&self, payload: AuthPayload) -> User {
        let user = payload.user.clone();
        self.api.session().sign_in(payload.user, payload.token).await;
        info!(user_id = %user.id, user_type = ?user.user_type, "Authenticated");
        user
    }
}

fn normalize_phone(phone: &str) -> Result<String, AuthError> {
    let phone: String = phone.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    let digits = phone.strip_prefix('+').unwrap_or(&phone);
    if digits.len() < 5 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AuthError::Invalid("phone number is invalid".into()));
    }
    Ok(phone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("138 0013-8000").unwrap(), "13800138000");
        assert_eq!(normalize_phone("+8613800138000").unwrap(), "+8613800138000");
        assert!(normalize_phone("").is_err());
        assert!(normalize_phone("abc12345").is_err());
    }

    #[test]
    fn test_login_body_omits_unused_fields() {
        let body = LoginBody {
            phone: "13800138000",
            password: None,
            code: Some("123456"),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value, serde_json::json!({"phone": "13800138000", "code": "123456"}));
    }

    #[test]
    fn test_invalid_input_is_validation_error() {
        let err = AppError::from(AuthError::Invalid("phone number is invalid".into()));
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.user_facing_message(), "phone number is invalid");
    }
}
