//! Client configuration.

use std::time::Duration;

use url::Url;

use crate::auth::AuthError;
use crate::guard::routes::RouteTable;

/// Token rotation endpoint.
pub const REFRESH_PATH: &str = "v1/api/refresh-token";
/// Credential sign-in endpoint.
pub const LOGIN_PATH: &str = "api/v1/login";
pub const SEND_OTP_PATH: &str = "v1/api/send-otp";
pub const RESET_PASSWORD_PATH: &str = "v1/api/resetpassword";
pub const REGISTER_PATH: &str = "api/v1/register-customer";
pub const ACTIVATE_PATH: &str = "api/activate-account";

/// Default backend base URL.
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";

/// An access token counts as expired this long before its real expiry.
pub const DEFAULT_ACCESS_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Proactive refresh fires this long before the access token expires.
pub const DEFAULT_REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);

/// Quiet period before a storage-level addition triggers a guard recheck.
pub const DEFAULT_STORAGE_DEBOUNCE: Duration = Duration::from_millis(100);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the session client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Backend base URL (e.g. "https://api.example.com").
    pub api_base: Url,
    /// Upper bound for every HTTP call.
    pub request_timeout: Duration,
    pub access_expiry_margin: Duration,
    pub refresh_lead: Duration,
    pub storage_debounce: Duration,
    /// Public/protected route classification plus login and landing routes.
    pub routes: RouteTable,
}

impl ClientConfig {
    /// Configuration with default tunables for the given backend.
    pub fn new(api_base: &str) -> Result<Self, AuthError> {
        Ok(Self {
            api_base: parse_base(api_base)?,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            access_expiry_margin: DEFAULT_ACCESS_EXPIRY_MARGIN,
            refresh_lead: DEFAULT_REFRESH_LEAD,
            storage_debounce: DEFAULT_STORAGE_DEBOUNCE,
            routes: RouteTable::default(),
        })
    }

    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                        | Default                  |
    /// |---------------------------------|--------------------------|
    /// | `PAYDASH_API_BASE`              | `http://127.0.0.1:8000`  |
    /// | `PAYDASH_REQUEST_TIMEOUT_SECS`  | `30`                     |
    /// | `PAYDASH_LOGIN_ROUTE`           | `/login`                 |
    /// | `PAYDASH_LANDING_ROUTE`         | `/dashboard`             |
    pub fn from_env() -> Result<Self, AuthError> {
        let base = std::env::var("PAYDASH_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.into());
        let mut config = Self::new(&base)?;

        if let Ok(raw) = std::env::var("PAYDASH_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                AuthError::Config(format!(
                    "PAYDASH_REQUEST_TIMEOUT_SECS must be seconds, got {raw:?}"
                ))
            })?;
            config.request_timeout = Duration::from_secs(secs.max(1));
        }

        let login = std::env::var("PAYDASH_LOGIN_ROUTE").ok();
        let landing = std::env::var("PAYDASH_LANDING_ROUTE").ok();
        if login.is_some() || landing.is_some() {
            let defaults = RouteTable::default();
            config.routes = RouteTable::new(
                login.as_deref().unwrap_or(defaults.login_route()),
                landing.as_deref().unwrap_or(defaults.landing_route()),
            )
            .public(crate::guard::routes::REGISTER_ROUTE)
            .public(crate::guard::routes::RESET_PASSWORD_ROUTE);
        }

        Ok(config)
    }

    /// Point at another backend, keeping every other setting.
    pub fn with_api_base(mut self, api_base: &str) -> Result<Self, AuthError> {
        self.api_base = parse_base(api_base)?;
        Ok(self)
    }

    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Absolute URL for an API path. Absolute URLs pass through unchanged.
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.api_base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn parse_base(raw: &str) -> Result<Url, AuthError> {
    let url =
        Url::parse(raw).map_err(|e| AuthError::Config(format!("invalid api base {raw:?}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(AuthError::Config(format!("{url} cannot be a base URL")));
    }
    Ok(url)
}
