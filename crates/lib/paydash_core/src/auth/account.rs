//! Account flows: sign-in, sign-out, registration and password reset.
//!
//! These endpoints are called without a bearer token. Only sign-in and
//! sign-out touch the session.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::AuthError;
use super::refresh::SessionManager;
use crate::config::{
    ACTIVATE_PATH, ClientConfig, LOGIN_PATH, REGISTER_PATH, RESET_PASSWORD_PATH, SEND_OTP_PATH,
};
use crate::models::session::{expiry_from_value, flag_value};
use crate::models::{Session, TokenSet, UserProfile};
use crate::navigation::Navigator;
use crate::transport::{HttpRequest, HttpTransport};

/// Customer self-registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct CustomerRegistration {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Any further fields the backend accepts.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Password reset with a one-time code from `send-otp`.
#[derive(Debug, Clone, Serialize)]
pub struct PasswordReset {
    pub email: String,
    pub otp: String,
    pub password: String,
}

/// Unauthenticated account operations plus sign-in/sign-out.
#[derive(Clone)]
pub struct AccountClient {
    config: ClientConfig,
    sessions: Arc<SessionManager>,
    transport: Arc<dyn HttpTransport>,
    navigator: Arc<dyn Navigator>,
}

impl AccountClient {
    pub fn new(
        config: ClientConfig,
        sessions: Arc<SessionManager>,
        transport: Arc<dyn HttpTransport>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            config,
            sessions,
            transport,
            navigator,
        }
    }

    /// Sign in with email and password.
    ///
    /// Persists the session, arms the proactive refresh and returns the
    /// stored session. Nothing is persisted on failure.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let body = self
            .post_public(LOGIN_PATH, json!({ "email": email, "password": password }))
            .await?;
        let session = session_from_login(body)?;
        self.sessions.store().save(&session)?;
        self.sessions.schedule_next();
        info!(
            email,
            is_staff = session.is_staff.unwrap_or(false),
            expires_at = %session.tokens.expires_at,
            "signed in"
        );
        Ok(session)
    }

    /// Sign out: stop the refresh timer, clear the session, go to login.
    pub fn logout(&self) {
        info!("signing out");
        self.sessions.end_session();
    }

    /// Signed in and holding the staff entitlement, go to the landing route.
    pub fn enter_dashboard(&self) {
        let validator = self.sessions.validator();
        if validator.is_authenticated() && validator.is_staff() {
            self.navigator.navigate(self.config.routes.landing_route());
        } else {
            warn!("session lacks staff entitlement; staying put");
        }
    }

    pub async fn send_otp(&self, email: &str) -> Result<Value, AuthError> {
        self.post_public(SEND_OTP_PATH, json!({ "email": email }))
            .await
    }

    pub async fn reset_password(&self, reset: &PasswordReset) -> Result<Value, AuthError> {
        self.post_public(RESET_PASSWORD_PATH, to_value(reset)?)
            .await
    }

    pub async fn register_customer(
        &self,
        registration: &CustomerRegistration,
    ) -> Result<Value, AuthError> {
        self.post_public(REGISTER_PATH, to_value(registration)?)
            .await
    }

    /// Activate an account with the token from the activation e-mail.
    pub async fn activate_account(&self, token: &str) -> Result<Value, AuthError> {
        self.post_public(ACTIVATE_PATH, json!({ "token": token }))
            .await
    }

    async fn post_public(&self, path: &str, body: Value) -> Result<Value, AuthError> {
        let request = HttpRequest::post(self.config.endpoint(path)).json(body);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            let message = response
                .json::<Value>()
                .ok()
                .and_then(|v| error_message(&v))
                .unwrap_or_else(|| response.text());
            return Err(AuthError::Rejected {
                status: response.status.as_u16(),
                message,
            });
        }
        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        response.json()
    }
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value, AuthError> {
    serde_json::to_value(payload).map_err(|e| AuthError::InvalidResponse(format!("encode: {e}")))
}

/// Build a session from a login response.
///
/// The response is flat: `access`, `refresh`, `exp`, an optional `is_staff`
/// and the user's own fields. A nested `user` object is used as the profile
/// when present.
pub fn session_from_login(body: Value) -> Result<Session, AuthError> {
    let Value::Object(mut fields) = body else {
        return Err(AuthError::InvalidResponse("login response is not an object".into()));
    };

    let access_token = take_token(&mut fields, "access")?;
    let refresh_token = take_token(&mut fields, "refresh")?;
    let expires_at = fields
        .remove("exp")
        .as_ref()
        .and_then(expiry_from_value)
        .ok_or_else(|| AuthError::InvalidResponse("login response missing exp".into()))?;

    let is_staff = fields.get("is_staff").and_then(flag_value);
    let user = match fields.remove("user") {
        Some(Value::Object(nested)) => Some(UserProfile(nested)),
        _ if fields.is_empty() => None,
        _ => Some(UserProfile(fields)),
    };
    let is_staff = is_staff.or_else(|| user.as_ref().and_then(UserProfile::is_staff));

    Ok(Session {
        tokens: TokenSet {
            access_token,
            refresh_token,
            expires_at,
        },
        user,
        is_staff,
    })
}

fn take_token(fields: &mut Map<String, Value>, key: &str) -> Result<String, AuthError> {
    match fields.remove(key) {
        Some(Value::String(token)) if !token.is_empty() => Ok(token),
        _ => Err(AuthError::InvalidResponse(format!("login response missing {key}"))),
    }
}

/// Pull a human-readable message out of an error body.
fn error_message(body: &Value) -> Option<String> {
    for key in ["message", "detail", "error"] {
        if let Some(msg) = body.get(key).and_then(Value::as_str) {
            return Some(msg.to_string());
        }
    }
    None
}
