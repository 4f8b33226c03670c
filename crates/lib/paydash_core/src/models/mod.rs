//! Domain models shared across the session core.

pub mod session;

pub use session::{RefreshResponse, Session, TokenSet, UserProfile};
