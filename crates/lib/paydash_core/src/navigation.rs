//! Navigation seam.
//!
//! The session core never renders anything; it only asks the host to move to
//! another route (login on session loss, landing after sign-in).

use std::sync::Mutex;

use tracing::info;

use crate::storage::lock;

/// Host navigation as seen by the session core.
pub trait Navigator: Send + Sync {
    fn current_route(&self) -> String;

    fn navigate(&self, route: &str);
}

/// Headless navigator: tracks the current route and every navigation.
#[derive(Debug)]
pub struct MemoryNavigator {
    current: Mutex<String>,
    history: Mutex<Vec<String>>,
}

impl MemoryNavigator {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(initial.into()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Routes navigated to, oldest first.
    pub fn history(&self) -> Vec<String> {
        lock(&self.history).clone()
    }

    pub fn last_navigation(&self) -> Option<String> {
        lock(&self.history).last().cloned()
    }
}

impl Navigator for MemoryNavigator {
    fn current_route(&self) -> String {
        lock(&self.current).clone()
    }

    fn navigate(&self, route: &str) {
        info!(route, "navigating");
        *lock(&self.current) = route.to_string();
        lock(&self.history).push(route.to_string());
    }
}
