//! API client for the SAGE REST backend.
//!
//! This module provides the `ApiClient` struct for making authenticated
//! requests. A 401 on an authorized request goes through the
//! [`RefreshCoordinator`] and the request is replayed once with the renewed
//! token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::models::{
    ChangePasswordRequest, LoginRequest, LoginResponse, LogoutRequest, RefreshRequest,
    RefreshResponse, TokenValidation, ValidateRequest,
};
use super::{ApiError, ApiResult};
use crate::auth::{RefreshCoordinator, TokenPair, TokenRefresher, TokenStore, UserProfile};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const LOGIN_PATH: &str = "/auth/login";
const REFRESH_PATH: &str = "/auth/refresh";
const LOGOUT_PATH: &str = "/auth/logout";
const ME_PATH: &str = "/auth/me";
const CHANGE_PASSWORD_PATH: &str = "/auth/change-password";
const VALIDATE_PATH: &str = "/auth/validate";

/// Build the shared HTTP client. The timeout also bounds token refreshes.
pub fn build_http_client(timeout: Duration) -> ApiResult<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Check if response is successful, returning an error with body if not.
async fn check_response(response: reqwest::Response) -> ApiResult<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }
}

/// Parse a JSON body; an empty body parses as `null`.
async fn parse_body<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
    let text = response.text().await?;
    let text = if text.trim().is_empty() { "null" } else { text.as_str() };
    Ok(serde_json::from_str(text)?)
}

/// Refreshes tokens over `/auth/refresh`, outside the 401 interception.
pub struct HttpRefresher {
    client: Client,
    base_url: String,
}

impl HttpRefresher {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        debug!("Requesting token refresh");
        let response = self
            .client
            .post(join_url(&self.base_url, REFRESH_PATH))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let response = check_response(response).await?;
        let body: RefreshResponse = parse_body(response).await?;
        Ok(TokenPair {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
        })
    }
}

/// API client for the SAGE backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    store: Arc<TokenStore>,
    coordinator: Arc<RefreshCoordinator>,
}

impl ApiClient {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            store: Arc::clone(coordinator.store()),
            coordinator,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    // ===== Authorized requests =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.execute(Method::GET, path, header::HeaderMap::new(), None)
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        let body = serde_json::to_value(body)?;
        self.execute(Method::POST, path, header::HeaderMap::new(), Some(body))
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        let body = serde_json::to_value(body)?;
        self.execute(Method::PUT, path, header::HeaderMap::new(), Some(body))
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.execute(Method::DELETE, path, header::HeaderMap::new(), None)
            .await
    }

    /// Send an authorized request, refreshing the token once on 401.
    ///
    /// The bearer header is added unless `headers` already carries an
    /// `Authorization` value, in which case the caller's header is sent as is.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        headers: header::HeaderMap,
        body: Option<serde_json::Value>,
    ) -> ApiResult<T> {
        let url = self.url(path);
        let caller_authorized = headers.contains_key(header::AUTHORIZATION);
        let mut token = if caller_authorized {
            None
        } else {
            self.store.access_token()
        };
        let mut retried = false;

        loop {
            let response = self
                .send_with_backoff(&method, &url, &headers, body.as_ref(), token.as_deref())
                .await?;

            if response.status() != StatusCode::UNAUTHORIZED || caller_authorized {
                let response = check_response(response).await?;
                return parse_body(response).await;
            }

            if retried {
                warn!(url = %url, "Request rejected again after token refresh");
                self.coordinator.expire_session();
                return Err(ApiError::SessionExpired);
            }

            retried = true;
            debug!(url = %url, "Unauthorized, recovering access token");
            let rejected = token.take().unwrap_or_default();
            token = Some(self.coordinator.recover(&rejected).await?);
        }
    }

    /// Send one request, retrying 429 responses with exponential backoff.
    async fn send_with_backoff(
        &self,
        method: &Method,
        url: &str,
        headers: &header::HeaderMap,
        body: Option<&serde_json::Value>,
        token: Option<&str>,
    ) -> ApiResult<reqwest::Response> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone());
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    // ===== Auth endpoints =====

    /// Exchange credentials for a token pair. Bypasses the refresh path:
    /// a 401 here means wrong credentials.
    pub async fn login(&self, username: &str, password: &str) -> ApiResult<LoginResponse> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::InvalidCredentials);
        }
        let response = check_response(response).await?;
        parse_body(response).await
    }

    /// Invalidate the session server-side
    pub async fn logout(&self, access_token: Option<&str>, refresh_token: &str) -> ApiResult<()> {
        let mut request = self
            .client
            .post(self.url(LOGOUT_PATH))
            .json(&LogoutRequest { refresh_token });
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        check_response(request.send().await?).await?;
        Ok(())
    }

    pub async fn me(&self) -> ApiResult<UserProfile> {
        self.get(ME_PATH).await
    }

    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> ApiResult<serde_json::Value> {
        self.post(
            CHANGE_PASSWORD_PATH,
            &ChangePasswordRequest {
                current_password,
                new_password,
            },
        )
        .await
    }

    /// Ask the server whether `token` is still accepted
    pub async fn validate_token(&self, token: &str) -> ApiResult<TokenValidation> {
        let response = self
            .client
            .post(self.url(VALIDATE_PATH))
            .json(&ValidateRequest { token })
            .send()
            .await?;

        let response = check_response(response).await?;
        parse_body(response).await
    }
}
