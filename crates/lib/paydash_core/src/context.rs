//! Wiring for one dashboard client.
//!
//! Every component shares the same storage, observer and navigator, so a
//! sign-in through [`AccountClient`] is immediately visible to the guard and
//! to the API client.

use std::sync::Arc;

use tracing::debug;

use crate::auth::{AccountClient, ApiClient, AuthError, SessionManager, TokenStore, TokenValidator};
use crate::config::ClientConfig;
use crate::guard::SessionGuard;
use crate::navigation::Navigator;
use crate::observer::SessionObserver;
use crate::storage::KeyValueStore;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Shared session state handed to the host application.
#[derive(Clone)]
pub struct AuthContext {
    pub config: ClientConfig,
    pub observer: SessionObserver,
    pub store: TokenStore,
    pub validator: TokenValidator,
    pub sessions: Arc<SessionManager>,
    pub api: ApiClient,
    pub accounts: AccountClient,
    pub guard: Arc<SessionGuard>,
    pub navigator: Arc<dyn Navigator>,
}

impl AuthContext {
    /// Build a context over `storage`.
    ///
    /// `observer` must be the one `storage` publishes to, if it publishes at
    /// all; the guard listens on it.
    pub fn new(
        config: ClientConfig,
        storage: Arc<dyn KeyValueStore>,
        observer: SessionObserver,
        navigator: Arc<dyn Navigator>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let store = TokenStore::new(storage, observer.clone());
        let sessions =
            SessionManager::new(&config, store.clone(), transport.clone(), navigator.clone());
        let api = ApiClient::new(config.clone(), sessions.clone(), transport.clone());
        let accounts =
            AccountClient::new(config.clone(), sessions.clone(), transport, navigator.clone());
        let guard = Arc::new(SessionGuard::new(&config, store.clone(), navigator.clone()));
        Self {
            validator: sessions.validator().clone(),
            config,
            observer,
            store,
            sessions,
            api,
            accounts,
            guard,
            navigator,
        }
    }

    /// Build a context that talks to the backend over HTTP.
    pub fn with_reqwest(
        config: ClientConfig,
        storage: Arc<dyn KeyValueStore>,
        observer: SessionObserver,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, AuthError> {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout)?);
        Ok(Self::new(config, storage, observer, navigator, transport))
    }

    /// Pick up a persisted session: arm the proactive refresh if one is
    /// stored. Returns whether a session was found.
    ///
    /// Must be called from within a Tokio runtime for the timer to arm.
    pub fn resume(&self) -> bool {
        if self.store.refresh().is_none() {
            debug!("no stored session to resume");
            return false;
        }
        self.sessions.schedule_next();
        true
    }
}
