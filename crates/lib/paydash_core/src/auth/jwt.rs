//! Token validation.
//!
//! Client-side checks are advisory. The server verifies signatures and
//! enforces expiry; these checks only decide whether a token is worth
//! sending and when to refresh it. Two lenient rules follow from that and
//! are kept as named policies:
//!
//! - [`is_structurally_valid`] decodes the header and payload but tolerates a
//!   signature segment that is not valid base64url.
//! - [`TokenValidator::is_authenticated`] accepts an expired access token as
//!   long as both tokens are present and the access token has three segments.
//!   Refresh happens on the first 401, not at guard time.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::store::TokenStore;

/// Decode one base64url JWT segment, with or without padding.
pub fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()
}

/// Three non-empty dot-separated segments, nothing more.
pub fn has_jwt_shape(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    segments.len() == 3 && segments.iter().all(|s| !s.is_empty())
}

/// Structural check: JWT shape plus decodable header and payload.
///
/// The signature segment only has to be non-empty.
pub fn is_structurally_valid(token: &str) -> bool {
    if !has_jwt_shape(token) {
        return false;
    }
    let mut segments = token.split('.');
    let header = segments.next().and_then(decode_segment);
    let payload = segments.next().and_then(decode_segment);
    header.is_some() && payload.is_some()
}

/// Decode the JSON payload of a JWT without verifying it.
pub fn decode_payload(token: &str) -> Option<Value> {
    if !has_jwt_shape(token) {
        return None;
    }
    let payload = token.split('.').nth(1).and_then(decode_segment)?;
    serde_json::from_slice(&payload).ok()
}

/// The `exp` claim of a JWT, as an instant.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let exp = decode_payload(token)?.get("exp")?.clone();
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp(secs, 0)
}

/// Expiry and authentication checks over the stored session.
#[derive(Clone)]
pub struct TokenValidator {
    store: TokenStore,
    access_margin: chrono::Duration,
}

impl TokenValidator {
    pub fn new(store: TokenStore, access_margin: std::time::Duration) -> Self {
        Self {
            store,
            access_margin: chrono::Duration::from_std(access_margin)
                .unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    /// True when no expiry is stored or the access token expires within the
    /// safety margin.
    pub fn is_access_expired(&self) -> bool {
        match self.store.expiry() {
            Some(expires_at) => expires_at - self.access_margin <= Utc::now(),
            None => true,
        }
    }

    /// True when the refresh token is absent, undecodable, has no `exp` claim
    /// or is past its `exp`.
    pub fn is_refresh_expired(&self) -> bool {
        self.store
            .refresh()
            .and_then(|token| token_expiry(&token))
            .is_none_or(|exp| exp <= Utc::now())
    }

    /// Soft authentication check.
    ///
    /// Presence of both tokens plus a three-segment access token is enough,
    /// whatever the expiry says. With no refresh token the access token must
    /// be structurally valid and unexpired.
    pub fn is_authenticated(&self) -> bool {
        let Some(access) = self.store.access() else {
            return false;
        };
        if self.store.refresh().is_some() && has_jwt_shape(&access) {
            return true;
        }
        is_structurally_valid(&access) && !self.is_access_expired()
    }

    /// Stored staff flag, else the cached user's `is_staff`, else false.
    pub fn is_staff(&self) -> bool {
        self.store
            .is_staff()
            .or_else(|| self.store.user().and_then(|u| u.is_staff()))
            .unwrap_or(false)
    }
}
