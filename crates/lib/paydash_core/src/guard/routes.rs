//! Route classification.
//!
//! Routes are registered explicitly as public or protected. A path nobody
//! registered is protected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const LOGIN_ROUTE: &str = "/login";
pub const REGISTER_ROUTE: &str = "/register";
pub const RESET_PASSWORD_ROUTE: &str = "/reset-password";
pub const LANDING_ROUTE: &str = "/dashboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// Reachable without a session (sign-in, registration, password reset).
    Public,
    /// Requires an authenticated staff session.
    Protected,
}

/// Route classification plus the two routes the guard redirects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    routes: HashMap<String, RouteKind>,
    login: String,
    landing: String,
}

impl RouteTable {
    /// A table with the login route registered as public and the landing
    /// route as protected.
    pub fn new(login: &str, landing: &str) -> Self {
        let login = normalize(login);
        let landing = normalize(landing);
        let mut routes = HashMap::new();
        routes.insert(login.clone(), RouteKind::Public);
        routes.insert(landing.clone(), RouteKind::Protected);
        Self {
            routes,
            login,
            landing,
        }
    }

    pub fn public(self, path: &str) -> Self {
        self.with(path, RouteKind::Public)
    }

    pub fn protected(self, path: &str) -> Self {
        self.with(path, RouteKind::Protected)
    }

    pub fn with(mut self, path: &str, kind: RouteKind) -> Self {
        self.routes.insert(normalize(path), kind);
        self
    }

    /// Classify a route. Query strings, fragments and trailing slashes are
    /// ignored.
    pub fn kind(&self, path: &str) -> RouteKind {
        self.routes
            .get(&normalize(path))
            .copied()
            .unwrap_or(RouteKind::Protected)
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.kind(path) == RouteKind::Public
    }

    pub fn login_route(&self) -> &str {
        &self.login
    }

    pub fn landing_route(&self) -> &str {
        &self.landing
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(LOGIN_ROUTE, LANDING_ROUTE)
            .public(REGISTER_ROUTE)
            .public(RESET_PASSWORD_ROUTE)
    }
}

fn normalize(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default().trim();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
