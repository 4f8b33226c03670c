//! Token store — CRUD over the persisted session fields.
//!
//! Pure storage, no policy. Every `save`/`rotate`/`clear` announces the new
//! authentication state on the [`SessionObserver`]. Writes through clones of
//! one store are serialized, so the conditional writes used by the refresh
//! coordinator cannot interleave with a sign-in or a sign-out.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::AuthError;
use crate::models::session::{format_expiry, parse_expiry, parse_flag};
use crate::models::{Session, TokenSet, UserProfile};
use crate::observer::SessionObserver;
use crate::storage::{KeyValueStore, lock};

pub const ACCESS_KEY: &str = "access";
pub const REFRESH_KEY: &str = "refresh";
pub const EXPIRY_KEY: &str = "exp";
pub const USER_KEY: &str = "user";
pub const STAFF_KEY: &str = "is_staff";

/// Every key the session occupies in storage.
pub const SESSION_KEYS: [&str; 5] = [ACCESS_KEY, REFRESH_KEY, EXPIRY_KEY, USER_KEY, STAFF_KEY];

/// Handle over the persisted session. Clones share the same storage.
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn KeyValueStore>,
    observer: SessionObserver,
    writes: Arc<Mutex<()>>,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn KeyValueStore>, observer: SessionObserver) -> Self {
        Self {
            storage,
            observer,
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn observer(&self) -> &SessionObserver {
        &self.observer
    }

    pub fn access(&self) -> Option<String> {
        self.non_empty(ACCESS_KEY)
    }

    pub fn refresh(&self) -> Option<String> {
        self.non_empty(REFRESH_KEY)
    }

    /// Expiry of the access token. Unparseable values read as absent.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        let raw = self.non_empty(EXPIRY_KEY)?;
        let parsed = parse_expiry(&raw);
        if parsed.is_none() {
            debug!(raw, "ignoring unparseable stored expiry");
        }
        parsed
    }

    pub fn user(&self) -> Option<UserProfile> {
        let raw = self.non_empty(USER_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!(error = %e, "ignoring unparseable cached user");
                None
            }
        }
    }

    /// The stored staff flag, without any fallback.
    pub fn is_staff(&self) -> Option<bool> {
        self.non_empty(STAFF_KEY).and_then(|raw| parse_flag(&raw))
    }

    /// The full session, if both tokens and the expiry are present.
    pub fn session(&self) -> Option<Session> {
        let tokens = TokenSet {
            access_token: self.access()?,
            refresh_token: self.refresh()?,
            expires_at: self.expiry()?,
        };
        Some(Session {
            tokens,
            user: self.user(),
            is_staff: self.is_staff(),
        })
    }

    /// Persist a whole session (sign-in). Absent optional fields are removed
    /// so nothing leaks over from a previous user.
    pub fn save(&self, session: &Session) -> Result<(), AuthError> {
        let _writes = lock(&self.writes);
        self.write_tokens(&session.tokens)?;
        match &session.user {
            Some(user) => {
                let raw = serde_json::to_string(user)
                    .map_err(|e| AuthError::InvalidResponse(format!("user encode: {e}")))?;
                self.storage.set(USER_KEY, &raw)?;
            }
            None => self.storage.remove(USER_KEY)?,
        }
        match session.is_staff {
            Some(flag) => self.storage.set(STAFF_KEY, &flag.to_string())?,
            None => self.storage.remove(STAFF_KEY)?,
        }
        self.observer.emit_change(true, false);
        Ok(())
    }

    /// Persist rotated tokens, keeping the cached user and staff flag.
    pub fn rotate(&self, tokens: &TokenSet) -> Result<(), AuthError> {
        let _writes = lock(&self.writes);
        self.write_tokens(tokens)?;
        self.observer.emit_change(true, true);
        Ok(())
    }

    /// [`rotate`](Self::rotate), but only while `expected_refresh` is still
    /// the stored refresh token. Returns `Ok(false)` without writing when the
    /// session was replaced or cleared in the meantime.
    pub fn rotate_if_current(
        &self,
        expected_refresh: &str,
        tokens: &TokenSet,
    ) -> Result<bool, AuthError> {
        let _writes = lock(&self.writes);
        if self.refresh().as_deref() != Some(expected_refresh) {
            return Ok(false);
        }
        self.write_tokens(tokens)?;
        self.observer.emit_change(true, true);
        Ok(true)
    }

    /// Remove every session field. Best effort: a key that fails to delete
    /// is logged and the rest are still removed.
    pub fn clear(&self) {
        let _writes = lock(&self.writes);
        self.remove_all();
    }

    /// [`clear`](Self::clear), but only while `expected_refresh` is still the
    /// stored refresh token. Returns whether anything was cleared.
    pub fn clear_if_current(&self, expected_refresh: &str) -> bool {
        let _writes = lock(&self.writes);
        if self.refresh().as_deref() != Some(expected_refresh) {
            return false;
        }
        self.remove_all();
        true
    }

    fn remove_all(&self) {
        for key in SESSION_KEYS {
            if let Err(e) = self.storage.remove(key) {
                warn!(key, error = %e, "failed to remove session field");
            }
        }
        self.observer.emit_change(false, false);
    }

    // Expiry first and access last, so a reader that sees the new access
    // token also sees its expiry.
    fn write_tokens(&self, tokens: &TokenSet) -> Result<(), AuthError> {
        let expiry = format_expiry(&tokens.expires_at);
        self.storage.set(EXPIRY_KEY, &expiry)?;
        self.storage.set(REFRESH_KEY, &tokens.refresh_token)?;
        self.storage.set(ACCESS_KEY, &tokens.access_token)?;
        Ok(())
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.storage.get(key).filter(|v| !v.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::SessionEvent;
    use crate::storage::MemoryStorage;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn store() -> (TokenStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (
            TokenStore::new(storage.clone(), SessionObserver::new()),
            storage,
        )
    }

    fn tokens() -> TokenSet {
        TokenSet {
            access_token: "a.b.c".into(),
            refresh_token: "d.e.f".into(),
            expires_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn empty_store_reads_absent() {
        let (store, _) = store();
        assert!(store.access().is_none());
        assert!(store.refresh().is_none());
        assert!(store.expiry().is_none());
        assert!(store.user().is_none());
        assert!(store.is_staff().is_none());
        assert!(store.session().is_none());
    }

    #[test]
    fn save_writes_every_field() {
        let (store, storage) = store();
        let user: UserProfile =
            serde_json::from_value(json!({"email": "ops@example.com"})).unwrap();
        let session = Session::new(tokens())
            .with_user(user.clone())
            .with_staff(true);

        store.save(&session).unwrap();

        assert_eq!(store.session(), Some(session));
        assert_eq!(storage.get(STAFF_KEY).as_deref(), Some("true"));
        assert_eq!(store.user(), Some(user));
    }

    #[test]
    fn save_without_user_drops_previous_profile() {
        let (store, _) = store();
        let profiled = Session::new(tokens())
            .with_user(UserProfile::default())
            .with_staff(true);
        store.save(&profiled).unwrap();
        store.save(&Session::new(tokens())).unwrap();
        assert!(store.user().is_none());
        assert!(store.is_staff().is_none());
    }

    #[test]
    fn rotate_keeps_profile_and_replaces_tokens() {
        let (store, _) = store();
        store
            .save(&Session::new(tokens()).with_staff(true))
            .unwrap();

        let rotated = TokenSet {
            access_token: "g.h.i".into(),
            refresh_token: "j.k.l".into(),
            expires_at: tokens().expires_at + Duration::minutes(15),
        };
        store.rotate(&rotated).unwrap();

        assert_eq!(store.access().as_deref(), Some("g.h.i"));
        assert_eq!(store.refresh().as_deref(), Some("j.k.l"));
        assert_eq!(store.expiry(), Some(rotated.expires_at));
        assert_eq!(store.is_staff(), Some(true));
    }

    #[test]
    fn clear_removes_all_session_keys() {
        let (store, storage) = store();
        let session = Session::new(tokens())
            .with_user(UserProfile::default())
            .with_staff(false);
        store.save(&session).unwrap();
        storage.set("theme", "dark").unwrap();

        store.clear();

        for key in SESSION_KEYS {
            assert!(storage.get(key).is_none(), "{key} should be cleared");
        }
        assert_eq!(storage.get("theme").as_deref(), Some("dark"));
    }

    #[test]
    fn conditional_writes_only_apply_to_the_expected_session() {
        let (store, _) = store();
        store
            .save(&Session::new(tokens()).with_staff(true))
            .unwrap();
        let rotated = TokenSet {
            access_token: "g.h.i".into(),
            refresh_token: "j.k.l".into(),
            expires_at: tokens().expires_at,
        };

        assert!(!store.rotate_if_current("stale.refresh.token", &rotated).unwrap());
        assert!(!store.clear_if_current("stale.refresh.token"));
        assert_eq!(store.access().as_deref(), Some("a.b.c"));

        assert!(store.rotate_if_current("d.e.f", &rotated).unwrap());
        assert_eq!(store.access().as_deref(), Some("g.h.i"));
        assert!(!store.clear_if_current("d.e.f"), "d.e.f was rotated away");
        assert!(store.clear_if_current("j.k.l"));
        assert!(store.session().is_none());
    }

    #[test]
    fn mutations_emit_session_changed() {
        let (store, _) = store();
        let mut events = store.observer().subscribe();

        store.save(&Session::new(tokens())).unwrap();
        store.rotate(&tokens()).unwrap();
        store.clear();

        let changes: Vec<_> = std::iter::from_fn(|| events.try_recv())
            .map(|e| match e {
                SessionEvent::Changed(c) => (c.is_authenticated, c.refreshed),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(changes, vec![(true, false), (true, true), (false, false)]);
    }

    #[test]
    fn blank_and_garbage_values_read_absent() {
        let (store, storage) = store();
        storage.set(ACCESS_KEY, "  ").unwrap();
        storage.set(EXPIRY_KEY, "soon").unwrap();
        storage.set(USER_KEY, "{oops").unwrap();
        storage.set(STAFF_KEY, "maybe").unwrap();
        assert!(store.access().is_none());
        assert!(store.expiry().is_none());
        assert!(store.user().is_none());
        assert!(store.is_staff().is_none());
    }
}
