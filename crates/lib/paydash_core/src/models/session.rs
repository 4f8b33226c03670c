//! Session domain models.
//!
//! The server speaks in loosely typed JSON (`exp` may be an ISO string or
//! epoch seconds, `is_staff` a bool or a string), so the helpers here accept
//! every shape the dashboard backend has been seen to send.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Epoch values above this are treated as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Cached profile of the signed-in user, as returned by the login endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile(pub Map<String, Value>);

impl UserProfile {
    /// Staff flag carried inside the profile, if any.
    pub fn is_staff(&self) -> Option<bool> {
        self.0.get("is_staff").and_then(flag_value)
    }

    pub fn email(&self) -> Option<&str> {
        self.0.get("email").and_then(Value::as_str)
    }
}

/// The rotating part of a session: what the refresh endpoint hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry of `access_token` (never of the refresh token).
    pub expires_at: DateTime<Utc>,
}

/// An authenticated session.
///
/// Access and refresh tokens are always present together.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub tokens: TokenSet,
    pub user: Option<UserProfile>,
    pub is_staff: Option<bool>,
}

impl Session {
    pub fn new(tokens: TokenSet) -> Self {
        Self {
            tokens,
            user: None,
            is_staff: None,
        }
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_staff(mut self, is_staff: bool) -> Self {
        self.is_staff = Some(is_staff);
        self
    }
}

/// Body of `POST /v1/api/refresh-token`.
///
/// Every field is optional on the wire; a response missing any of them is a
/// failed refresh.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshResponse {
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub refresh: Option<String>,
    #[serde(default)]
    pub exp: Option<Value>,
}

impl RefreshResponse {
    /// Returns the rotated tokens, or `None` when the response is incomplete.
    pub fn into_token_set(self) -> Option<TokenSet> {
        let access_token = self.access.filter(|t| !t.is_empty())?;
        let refresh_token = self.refresh.filter(|t| !t.is_empty())?;
        let expires_at = self.exp.as_ref().and_then(expiry_from_value)?;
        Some(TokenSet {
            access_token,
            refresh_token,
            expires_at,
        })
    }
}

/// Format an expiry for persistence.
pub fn format_expiry(expires_at: &DateTime<Utc>) -> String {
    expires_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a persisted or server-sent expiry string.
///
/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS[.fff]` (read as UTC) and
/// bare epoch seconds or milliseconds.
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    raw.parse::<i64>().ok().and_then(from_epoch)
}

/// Interpret a JSON `exp` value (string or number).
pub fn expiry_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_expiry(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value > EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// Interpret a loosely typed boolean (`true`, `"true"`, `"1"`, `1`).
pub fn flag_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => parse_flag(s),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Parse a stringified boolean.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
