//! Authentication and session logic.
//!
//! - [`store`]: persisted session fields
//! - [`jwt`]: structural and expiry checks
//! - [`refresh`]: the single-flight refresh coordinator
//! - [`client`]: bearer-authenticated requests with retry-on-401
//! - [`account`]: sign-in, sign-out and the unauthenticated account flows

pub mod account;
pub mod client;
pub mod jwt;
pub mod refresh;
pub mod store;

pub use account::AccountClient;
pub use client::ApiClient;
pub use jwt::TokenValidator;
pub use refresh::SessionManager;
pub use store::TokenStore;

use thiserror::Error;

use crate::storage::StorageError;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A guarded request was attempted without a stored access token.
    #[error("No access token stored; sign in first")]
    MissingToken,

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("No refresh token stored")]
    MissingRefreshToken,

    #[error("Refresh token expired")]
    RefreshTokenExpired,

    #[error("Refresh request failed: {0}")]
    RefreshRequestFailed(String),

    /// The server answered an account call with a non-success status.
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}
