//! Refresh coordinator.
//!
//! Two states, Idle and Refreshing. While Refreshing, every caller of
//! [`SessionManager::refresh`] awaits the same in-flight future, so the
//! refresh endpoint sees exactly one call and the refresh token is rotated
//! exactly once. At most one proactive refresh timer exists at a time;
//! arming a new one aborts the previous one.
//!
//! The outcome is only applied if the refresh token that was sent is still
//! the stored one. A sign-out or a new sign-in during the request wins.
//!
//! ```text
//!   Idle ──refresh()──→ Refreshing ──ok──→ rotate, schedule next ──→ Idle
//!                            │
//!                            ├──err──→ clear, go to login ─────────→ Idle
//!                            │
//!                            └──session replaced──→ discard ───────→ Idle
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::json;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use super::AuthError;
use super::jwt::TokenValidator;
use super::store::TokenStore;
use crate::config::{ClientConfig, REFRESH_PATH};
use crate::models::{RefreshResponse, TokenSet};
use crate::navigation::Navigator;
use crate::storage::lock;
use crate::transport::{HttpRequest, HttpTransport};

type InFlight = Shared<BoxFuture<'static, bool>>;

/// The pending proactive refresh.
struct ScheduledRefresh {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Owns the refresh lifecycle of one session.
///
/// Create one per process (or per test) and share it through an `Arc`.
pub struct SessionManager {
    store: TokenStore,
    validator: TokenValidator,
    transport: Arc<dyn HttpTransport>,
    navigator: Arc<dyn Navigator>,
    refresh_url: String,
    login_route: String,
    refresh_lead: chrono::Duration,
    in_flight: Mutex<Option<InFlight>>,
    scheduled: Mutex<Option<ScheduledRefresh>>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(
        config: &ClientConfig,
        store: TokenStore,
        transport: Arc<dyn HttpTransport>,
        navigator: Arc<dyn Navigator>,
    ) -> Arc<Self> {
        let validator = TokenValidator::new(store.clone(), config.access_expiry_margin);
        Arc::new(Self {
            store,
            validator,
            transport,
            navigator,
            refresh_url: config.endpoint(REFRESH_PATH),
            login_route: config.routes.login_route().to_string(),
            refresh_lead: chrono::Duration::from_std(config.refresh_lead)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            in_flight: Mutex::new(None),
            scheduled: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// True while a refresh is in flight.
    pub fn is_refreshing(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// True while a proactive refresh timer is armed.
    pub fn has_scheduled_refresh(&self) -> bool {
        lock(&self.scheduled).is_some()
    }

    /// Refresh the access token.
    ///
    /// Joins the in-flight refresh if there is one. On failure the session
    /// is cleared and the host is sent to the login route before this
    /// returns `false`. A refresh whose session was signed out or replaced
    /// while the request was out also returns `false`, and leaves the
    /// current session alone.
    ///
    /// The refresh runs as its own task, so it completes and releases the
    /// in-flight slot even if every caller is dropped. Must be called from
    /// within a Tokio runtime.
    pub async fn refresh(self: &Arc<Self>) -> bool {
        let in_flight = {
            let mut slot = lock(&self.in_flight);
            match slot.as_ref() {
                Some(existing) => {
                    debug!("refresh already in flight; joining");
                    existing.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        let _slot = InFlightSlot(&this);
                        this.run_refresh().await
                    });
                    let fut = task.map(settle).boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        in_flight.await
    }

    async fn run_refresh(self: &Arc<Self>) -> bool {
        let Some(sent) = self.store.refresh() else {
            warn!(error = %AuthError::MissingRefreshToken, "cannot refresh; ending session");
            self.end_session();
            return false;
        };
        if self.validator.is_refresh_expired() {
            warn!(error = %AuthError::RefreshTokenExpired, "cannot refresh; ending session");
            self.end_session();
            return false;
        }

        info!("refreshing access token");
        let tokens = match self.request_rotation(&sent).await {
            Ok(tokens) => tokens,
            Err(e) => {
                if self.store.clear_if_current(&sent) {
                    warn!(error = %e, "token refresh failed; session ended");
                    self.leave_session();
                } else {
                    debug!(error = %e, "token refresh failed for a session that is gone");
                }
                return false;
            }
        };
        match self.store.rotate_if_current(&sent, &tokens) {
            Ok(true) => {
                info!(expires_at = %tokens.expires_at, "access token refreshed");
                self.schedule_next();
                true
            }
            Ok(false) => {
                info!("session changed while refreshing; rotated tokens discarded");
                false
            }
            Err(e) => {
                error!(error = %e, "could not persist rotated tokens; ending session");
                if self.store.clear_if_current(&sent) {
                    self.leave_session();
                }
                false
            }
        }
    }

    async fn request_rotation(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
        let request =
            HttpRequest::post(self.refresh_url.as_str()).json(json!({ "refresh": refresh_token }));
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| AuthError::RefreshRequestFailed(e.to_string()))?;

        if !response.is_success() {
            return Err(AuthError::RefreshRequestFailed(format!(
                "HTTP {}: {}",
                response.status,
                response.text()
            )));
        }

        response
            .json::<RefreshResponse>()
            .map_err(|e| AuthError::RefreshRequestFailed(e.to_string()))?
            .into_token_set()
            .ok_or_else(|| {
                AuthError::RefreshRequestFailed("response missing access, refresh or exp".into())
            })
    }

    /// Arm the proactive refresh for `expiry - refresh_lead`, replacing any
    /// pending timer. A refresh that is already due runs right away, unless
    /// one is in flight, in which case that one stands in for it.
    ///
    /// Outside a Tokio runtime nothing is scheduled.
    pub fn schedule_next(self: &Arc<Self>) {
        self.cancel_scheduled();

        let Some(expires_at) = self.store.expiry() else {
            debug!("no stored expiry; proactive refresh not scheduled");
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no async runtime; proactive refresh not scheduled");
                return;
            }
        };

        let delay = (expires_at - Utc::now() - self.refresh_lead)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let weak = Arc::downgrade(self);

        if delay.is_zero() {
            if self.is_refreshing() {
                debug!("refresh already due and in flight");
                return;
            }
            info!("access token due for refresh; refreshing now");
            runtime.spawn(async move {
                if let Some(manager) = weak.upgrade() {
                    manager.refresh().await;
                }
            });
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = runtime.spawn(Self::timer(weak, generation, delay));
        debug!(delay_secs = delay.as_secs(), "proactive refresh scheduled");

        let mut slot = lock(&self.scheduled);
        if let Some(previous) = slot.replace(ScheduledRefresh { generation, handle }) {
            previous.handle.abort();
        }
    }

    async fn timer(manager: Weak<Self>, generation: u64, delay: Duration) {
        tokio::time::sleep(delay).await;
        let Some(manager) = manager.upgrade() else {
            return;
        };
        {
            let mut slot = lock(&manager.scheduled);
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                // Detach rather than abort: this task is the one running.
                slot.take();
            }
        }
        manager.refresh().await;
    }

    /// Cancel the pending proactive refresh, if any.
    pub fn cancel_scheduled(&self) {
        if let Some(previous) = lock(&self.scheduled).take() {
            previous.handle.abort();
            debug!("proactive refresh cancelled");
        }
    }

    /// Drop the session and send the host to the login route unless it is
    /// already there. In-flight requests are left to finish; their results
    /// no longer match any session.
    pub fn end_session(&self) {
        self.store.clear();
        self.leave_session();
    }

    // Everything `end_session` does besides clearing storage.
    fn leave_session(&self) {
        self.cancel_scheduled();
        if self.navigator.current_route() != self.login_route {
            self.navigator.navigate(&self.login_route);
        }
    }
}

fn settle(joined: Result<bool, JoinError>) -> bool {
    joined.unwrap_or_else(|e| {
        error!(error = %e, "refresh task did not complete");
        false
    })
}

/// Frees the in-flight slot when the refresh task ends, however it ends.
struct InFlightSlot<'a>(&'a SessionManager);

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        *lock(&self.0.in_flight) = None;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cancel_scheduled();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use http::StatusCode;
    use serde_json::Value;

    use super::*;
    use crate::auth::store::SESSION_KEYS;
    use crate::models::{Session, UserProfile};
    use crate::navigation::MemoryNavigator;
    use crate::observer::{SessionEvent, SessionObserver};
    use crate::storage::{KeyValueStore, MemoryStorage};
    use crate::transport::HttpResponse;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn jwt_expiring_in(secs: i64) -> String {
        let exp = (Utc::now() + ChronoDuration::seconds(secs)).timestamp();
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256"}"#),
            URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#))
        )
    }

    /// Refresh endpoint double: counts calls, optionally waits before answering.
    struct RefreshEndpoint {
        calls: AtomicUsize,
        status: StatusCode,
        body: Value,
        delay: Duration,
    }

    impl RefreshEndpoint {
        fn ok(access_ttl_secs: i64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                status: StatusCode::OK,
                body: serde_json::json!({
                    "access": jwt_expiring_in(access_ttl_secs),
                    "refresh": jwt_expiring_in(86_400),
                    "exp": (Utc::now() + ChronoDuration::seconds(access_ttl_secs)).to_rfc3339(),
                }),
                delay: Duration::from_millis(50),
            }
        }

        fn failing(status: StatusCode) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                status,
                body: serde_json::json!({"detail": "Token is invalid or expired"}),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for RefreshEndpoint {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, AuthError> {
            assert!(request.url.ends_with("/v1/api/refresh-token"));
            assert!(request.body.as_ref().and_then(|b| b.get("refresh")).is_some());
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(HttpResponse::json_body(self.status, &self.body))
        }
    }

    struct Harness {
        manager: Arc<SessionManager>,
        endpoint: Arc<RefreshEndpoint>,
        storage: Arc<MemoryStorage>,
        navigator: Arc<MemoryNavigator>,
    }

    fn harness(endpoint: RefreshEndpoint, route: &str) -> Harness {
        let config = ClientConfig::new("http://api.test").unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let store = TokenStore::new(storage.clone(), SessionObserver::new());
        let endpoint = Arc::new(endpoint);
        let navigator = Arc::new(MemoryNavigator::new(route));
        let manager = SessionManager::new(&config, store, endpoint.clone(), navigator.clone());
        Harness {
            manager,
            endpoint,
            storage,
            navigator,
        }
    }

    fn spawn_refresh(h: &Harness) -> JoinHandle<bool> {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.refresh().await })
    }

    fn sign_in(h: &Harness, refresh_ttl_secs: i64) {
        let session = Session::new(TokenSet {
            access_token: jwt_expiring_in(10),
            refresh_token: jwt_expiring_in(refresh_ttl_secs),
            expires_at: Utc::now() + ChronoDuration::seconds(10),
        })
        .with_user(UserProfile::default())
        .with_staff(true);
        h.manager.store().save(&session).unwrap();
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_network_call() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);

        let results = futures::future::join_all((0..8).map(|_| {
            let manager = h.manager.clone();
            async move { manager.refresh().await }
        }))
        .await;

        assert!(results.iter().all(|ok| *ok));
        assert_eq!(h.endpoint.calls(), 1);
        assert!(!h.manager.is_refreshing());
    }

    #[tokio::test]
    async fn refreshes_after_completion_hit_the_network_again() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);

        assert!(h.manager.refresh().await);
        assert!(h.manager.refresh().await);
        assert_eq!(h.endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn successful_refresh_rotates_tokens_and_schedules_next() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);
        let before = h.manager.store().access();

        assert!(h.manager.refresh().await);

        let after = h.manager.store().access();
        assert_ne!(before, after);
        assert_eq!(h.manager.store().is_staff(), Some(true));
        assert!(h.manager.has_scheduled_refresh());
        assert!(h.navigator.history().is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_clears_every_session_field() {
        let h = harness(RefreshEndpoint::failing(StatusCode::UNAUTHORIZED), "/dashboard");
        sign_in(&h, 86_400);

        assert!(!h.manager.refresh().await);

        assert_eq!(h.endpoint.calls(), 1);
        for key in SESSION_KEYS {
            assert!(h.storage.get(key).is_none(), "{key} should be cleared");
        }
        assert_eq!(h.navigator.history(), vec!["/login"]);
    }

    #[tokio::test]
    async fn incomplete_refresh_response_is_a_failure() {
        let mut endpoint = RefreshEndpoint::ok(3600);
        endpoint.body = serde_json::json!({"access": jwt_expiring_in(3600)});
        let h = harness(endpoint, "/dashboard");
        sign_in(&h, 86_400);

        assert!(!h.manager.refresh().await);
        assert!(h.manager.store().access().is_none());
    }

    #[tokio::test]
    async fn expired_refresh_token_fails_without_network_call() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, -10);

        assert!(!h.manager.refresh().await);
        assert_eq!(h.endpoint.calls(), 0);
        assert!(h.manager.store().refresh().is_none());
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_network_call() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");

        assert!(!h.manager.refresh().await);
        assert_eq!(h.endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn failure_on_login_route_does_not_navigate() {
        let h = harness(RefreshEndpoint::failing(StatusCode::BAD_REQUEST), "/login");
        sign_in(&h, 86_400);

        assert!(!h.manager.refresh().await);
        assert!(h.navigator.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_refresh_fires_before_expiry() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);
        h.storage
            .set(
                "exp",
                &(Utc::now() + ChronoDuration::minutes(6)).to_rfc3339(),
            )
            .unwrap();

        h.manager.schedule_next();
        assert!(h.manager.has_scheduled_refresh());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.endpoint.calls(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.endpoint.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_timer() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);
        h.storage
            .set("exp", &(Utc::now() + ChronoDuration::minutes(6)).to_rfc3339())
            .unwrap();
        h.manager.schedule_next();

        h.storage
            .set("exp", &(Utc::now() + ChronoDuration::hours(1)).to_rfc3339())
            .unwrap();
        h.manager.schedule_next();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.endpoint.calls(), 0, "first timer must be cancelled");
        assert!(h.manager.has_scheduled_refresh());
    }

    #[tokio::test]
    async fn due_refresh_runs_immediately() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);

        h.manager.schedule_next();
        assert!(!h.manager.has_scheduled_refresh());

        for _ in 0..50 {
            if h.endpoint.calls() == 1 && !h.manager.is_refreshing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_scheduled_disarms_timer() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);
        h.storage
            .set("exp", &(Utc::now() + ChronoDuration::hours(1)).to_rfc3339())
            .unwrap();

        h.manager.schedule_next();
        assert!(h.manager.has_scheduled_refresh());
        h.manager.cancel_scheduled();
        assert!(!h.manager.has_scheduled_refresh());
    }

    #[tokio::test]
    async fn sign_out_during_refresh_stays_signed_out() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);
        let mut events = h.manager.store().observer().subscribe();

        let pending = spawn_refresh(&h);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.endpoint.calls(), 1);
        h.manager.end_session();

        assert!(!pending.await.unwrap());
        for key in SESSION_KEYS {
            assert!(h.storage.get(key).is_none(), "{key} must stay cleared");
        }
        assert!(!h.manager.has_scheduled_refresh());
        assert_eq!(h.navigator.history(), vec!["/login"]);
        let changes: Vec<_> = std::iter::from_fn(|| events.try_recv())
            .filter_map(|e| match e {
                SessionEvent::Changed(c) => Some((c.is_authenticated, c.refreshed)),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec![(false, false)], "only the sign-out is announced");
    }

    #[tokio::test]
    async fn sign_in_during_refresh_is_not_overwritten() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);

        let pending = spawn_refresh(&h);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let replacement = TokenSet {
            access_token: "next.access.token".into(),
            refresh_token: jwt_expiring_in(2 * 86_400),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        };
        h.manager
            .store()
            .save(&Session::new(replacement.clone()))
            .unwrap();

        assert!(!pending.await.unwrap());
        assert_eq!(h.manager.store().access(), Some(replacement.access_token));
        assert_eq!(h.manager.store().refresh(), Some(replacement.refresh_token));
        assert!(!h.manager.has_scheduled_refresh());
        assert!(h.navigator.history().is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_of_a_replaced_session_keeps_the_new_one() {
        let h = harness(
            RefreshEndpoint {
                delay: Duration::from_millis(50),
                ..RefreshEndpoint::failing(StatusCode::UNAUTHORIZED)
            },
            "/dashboard",
        );
        sign_in(&h, 86_400);

        let pending = spawn_refresh(&h);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let replacement = jwt_expiring_in(2 * 86_400);
        h.manager
            .store()
            .save(&Session::new(TokenSet {
                access_token: "next.access.token".into(),
                refresh_token: replacement.clone(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            }))
            .unwrap();

        assert!(!pending.await.unwrap());
        assert_eq!(h.endpoint.calls(), 1);
        assert_eq!(h.manager.store().refresh(), Some(replacement));
        assert!(h.navigator.history().is_empty());
    }

    #[tokio::test]
    async fn refresh_completes_when_its_only_caller_goes_away() {
        let h = harness(RefreshEndpoint::ok(3600), "/dashboard");
        sign_in(&h, 86_400);
        let before = h.manager.store().access();

        let caller = spawn_refresh(&h);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.manager.is_refreshing());
        caller.abort();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.endpoint.calls(), 1);
        assert!(!h.manager.is_refreshing());
        assert_ne!(h.manager.store().access(), before);
        assert!(h.manager.has_scheduled_refresh());
        assert_eq!(Arc::strong_count(&h.manager), 1);
    }
}
