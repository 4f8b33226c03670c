//! # paydash_core
//!
//! Session core for the Paydash merchant dashboard client.
//!
//! Owns the JWT access/refresh token pair, keeps it fresh, attaches it to
//! outgoing API calls and decides which routes a session may see.

pub mod auth;
pub mod config;
pub mod context;
pub mod guard;
pub mod models;
pub mod navigation;
pub mod observer;
pub mod storage;
pub mod transport;

pub use context::AuthContext;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
