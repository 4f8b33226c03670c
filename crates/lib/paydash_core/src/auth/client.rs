//! Bearer-authenticated API client.
//!
//! Attaches the stored access token to each request. A 401 answered while a
//! live refresh token is stored triggers one coordinated refresh and exactly
//! one retry; whatever the retry returns goes back to the caller as is. If
//! the token was already rotated by the time the 401 arrives, the retry uses
//! the rotated token and no second refresh is started.

use std::sync::Arc;

use http::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::AuthError;
use super::jwt::is_structurally_valid;
use super::refresh::SessionManager;
use crate::config::ClientConfig;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Client for bearer-authenticated dashboard endpoints.
#[derive(Clone)]
pub struct ApiClient {
    config: ClientConfig,
    sessions: Arc<SessionManager>,
    transport: Arc<dyn HttpTransport>,
}

impl ApiClient {
    pub fn new(
        config: ClientConfig,
        sessions: Arc<SessionManager>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            config,
            sessions,
            transport,
        }
    }

    /// Send `request` with the stored access token.
    ///
    /// # Errors
    /// - [`AuthError::MissingToken`] when no access token is stored; nothing
    ///   is sent.
    /// - Transport failures of the request itself.
    ///
    /// Auth failures never surface as errors: a 401 that cannot be recovered
    /// is returned as the response, after the session has been ended.
    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse, AuthError> {
        let store = self.sessions.store();
        let access = store.access().ok_or(AuthError::MissingToken)?;
        if !is_structurally_valid(&access) {
            warn!(
                url = %request.url,
                error = %AuthError::MalformedToken("access token is not a well-formed JWT".into()),
                "sending anyway; the server decides"
            );
        }

        let response = self
            .transport
            .send(request.clone().with_bearer(&access)?)
            .await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        match store.access() {
            Some(current) if current != access => {
                debug!(url = %request.url, "token rotated while request was out; retrying");
                return self.transport.send(request.with_bearer(&current)?).await;
            }
            Some(_) => {}
            None => {
                debug!(url = %request.url, "401 after the session ended");
                return Ok(response);
            }
        }

        if store.refresh().is_none() || self.sessions.validator().is_refresh_expired() {
            debug!(url = %request.url, "401 without a usable refresh token");
            return Ok(response);
        }

        info!(url = %request.url, "401 received; refreshing session");
        if !self.sessions.refresh().await {
            warn!(url = %request.url, "refresh failed; session ended");
            return Ok(response);
        }

        let Some(fresh) = store.access() else {
            return Ok(response);
        };
        debug!(url = %request.url, "retrying with refreshed token");
        self.transport.send(request.with_bearer(&fresh)?).await
    }

    /// `GET` an API path.
    pub async fn get(&self, path: &str) -> Result<HttpResponse, AuthError> {
        self.request(HttpRequest::get(self.config.endpoint(path)))
            .await
    }

    /// `POST` a JSON body to an API path.
    pub async fn post_json(&self, path: &str, body: Value) -> Result<HttpResponse, AuthError> {
        self.request(HttpRequest::post(self.config.endpoint(path)).json(body))
            .await
    }

    /// Any method with an optional JSON body.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<HttpResponse, AuthError> {
        let mut request = HttpRequest::new(method, self.config.endpoint(path));
        request.body = body;
        self.request(request).await
    }
}
