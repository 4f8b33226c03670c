//! Session guard: decides, per route, whether to render or redirect.
//!
//! ```text
//!   Loading ──route change──→ Checking ──┬──→ Authorized
//!                                 ↑      └──→ Redirecting
//!                                 └── route change / session event
//! ```
//!
//! The guard re-evaluates on every route change reported by the host and on
//! session events from the [`SessionObserver`](crate::observer::SessionObserver):
//!
//! - explicit session-changed signals trigger an immediate recheck;
//! - a storage event that adds a session value triggers a debounced recheck;
//! - a storage event that removes a session value is ignored. Sign-out
//!   navigation belongs to the explicit logout action, and rechecking here
//!   would race it.

pub mod routes;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use self::routes::{RouteKind, RouteTable};
use crate::auth::jwt::TokenValidator;
use crate::auth::store::{SESSION_KEYS, TokenStore};
use crate::config::ClientConfig;
use crate::navigation::Navigator;
use crate::observer::{SessionEvent, Subscription};
use crate::storage::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardState {
    /// No route evaluated yet.
    Loading,
    Checking,
    /// The current route may render.
    Authorized,
    Redirecting { to: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Render,
    Redirect(String),
}

/// Authentication facts the routing policy looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub authenticated: bool,
    pub is_staff: bool,
}

/// What a session event asks of the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    RecheckNow,
    RecheckDebounced,
    Ignore,
}

/// Routing policy. Staff entitlement is mandatory: an authenticated
/// non-staff session is sent to login from every route.
pub fn decide(snapshot: AuthSnapshot, kind: RouteKind, routes: &RouteTable) -> GuardDecision {
    let login = || GuardDecision::Redirect(routes.login_route().to_string());
    match (snapshot.authenticated, snapshot.is_staff, kind) {
        (true, false, _) => login(),
        (true, true, RouteKind::Public) => {
            GuardDecision::Redirect(routes.landing_route().to_string())
        }
        (false, _, RouteKind::Protected) => login(),
        _ => GuardDecision::Render,
    }
}

/// Classify a session event.
pub fn classify(event: &SessionEvent) -> EventAction {
    match event {
        SessionEvent::Changed(_) => EventAction::RecheckNow,
        SessionEvent::Storage(ev) if !SESSION_KEYS.contains(&ev.key.as_str()) => {
            EventAction::Ignore
        }
        SessionEvent::Storage(ev) if ev.is_addition() => EventAction::RecheckDebounced,
        SessionEvent::Storage(_) => EventAction::Ignore,
    }
}

#[derive(Debug)]
struct GuardInner {
    state: GuardState,
    route: Option<String>,
    snapshot: Option<AuthSnapshot>,
}

/// Route gate over the stored session.
pub struct SessionGuard {
    routes: RouteTable,
    store: TokenStore,
    validator: TokenValidator,
    navigator: Arc<dyn Navigator>,
    debounce: Duration,
    inner: Mutex<GuardInner>,
}

impl SessionGuard {
    pub fn new(config: &ClientConfig, store: TokenStore, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            routes: config.routes.clone(),
            validator: TokenValidator::new(store.clone(), config.access_expiry_margin),
            store,
            navigator,
            debounce: config.storage_debounce,
            inner: Mutex::new(GuardInner {
                state: GuardState::Loading,
                route: None,
                snapshot: None,
            }),
        }
    }

    pub fn state(&self) -> GuardState {
        lock(&self.inner).state.clone()
    }

    /// Snapshot used by the last evaluation.
    pub fn snapshot(&self) -> Option<AuthSnapshot> {
        lock(&self.inner).snapshot
    }

    pub fn current_route(&self) -> Option<String> {
        lock(&self.inner).route.clone()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Evaluate a route the host is about to show.
    pub fn on_route_change(&self, route: &str) -> GuardDecision {
        self.evaluate(route)
    }

    /// Re-evaluate the current route. `None` before the first route change.
    pub fn recheck(&self) -> Option<GuardDecision> {
        let route = self.current_route()?;
        debug!(route, "rechecking session");
        Some(self.evaluate(&route))
    }

    fn snapshot_now(&self) -> AuthSnapshot {
        AuthSnapshot {
            authenticated: self.validator.is_authenticated(),
            is_staff: self.validator.is_staff(),
        }
    }

    fn evaluate(&self, route: &str) -> GuardDecision {
        {
            let mut inner = lock(&self.inner);
            inner.state = GuardState::Checking;
            inner.route = Some(route.to_string());
        }

        let kind = self.routes.kind(route);
        let mut snapshot = self.snapshot_now();
        let mut decision = decide(snapshot, kind, &self.routes);

        // Re-read storage before acting on a missing session: a sign-in may
        // have landed after the snapshot was taken.
        let to_login = decision == GuardDecision::Redirect(self.routes.login_route().to_string());
        if to_login
            && !snapshot.authenticated
            && self.store.access().is_some()
            && self.store.refresh().is_some()
        {
            debug!(route, "session present on re-read; login redirect abandoned");
            snapshot = AuthSnapshot {
                authenticated: true,
                is_staff: self.validator.is_staff(),
            };
            decision = decide(snapshot, kind, &self.routes);
        }

        let navigate_to = {
            let mut inner = lock(&self.inner);
            inner.snapshot = Some(snapshot);
            match &decision {
                GuardDecision::Render => {
                    inner.state = GuardState::Authorized;
                    None
                }
                GuardDecision::Redirect(to) => {
                    inner.state = GuardState::Redirecting { to: to.clone() };
                    if to != route {
                        inner.route = Some(to.clone());
                        Some(to.clone())
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(to) = navigate_to {
            info!(
                from = route,
                to,
                authenticated = snapshot.authenticated,
                is_staff = snapshot.is_staff,
                "guard redirect"
            );
            self.navigator.navigate(&to);
        }
        decision
    }

    /// Subscribe to session events and recheck in the background.
    ///
    /// Must be called from within a Tokio runtime. Abort the handle to stop.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.store.observer().subscribe();
        let guard = Arc::clone(self);
        tokio::spawn(async move { guard.listen(events).await })
    }

    /// Event loop behind [`spawn_listener`](Self::spawn_listener). Returns
    /// once every publisher on the subscription's channel is dropped.
    pub async fn listen(&self, mut events: Subscription) {
        let mut pending: Option<Instant> = None;
        loop {
            let deadline = pending;
            let wake_at = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match classify(&event) {
                        EventAction::RecheckNow => {
                            pending = None;
                            self.recheck();
                        }
                        EventAction::RecheckDebounced => {
                            pending = Some(Instant::now() + self.debounce);
                        }
                        EventAction::Ignore => {
                            debug!(?event, "session event ignored");
                        }
                    }
                }
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    pending = None;
                    self.recheck();
                }
            }
        }
        debug!("session observer closed; guard listener stopped");
    }
}
