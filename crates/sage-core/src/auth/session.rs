use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::{SessionEvent, EVENT_CHANNEL_CAPACITY};
use super::refresh::RefreshCoordinator;
use super::storage::SessionStorage;
use super::store::TokenStore;
use super::token;
use super::user::UserProfile;
use crate::api::{
    build_http_client, ApiClient, ApiError, ApiResult, HttpRefresher, LoginResponse,
    TokenValidation,
};
use crate::config::Config;

/// Owns the session of one user against one API base URL.
pub struct SessionManager {
    api: ApiClient,
    store: Arc<TokenStore>,
    coordinator: Arc<RefreshCoordinator>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Build a manager from the configured base URL, timeout and storage
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let storage = config.session_storage()?;
        Ok(Self::new(
            &config.api_base_url,
            config.request_timeout(),
            storage,
        )?)
    }

    pub fn new(
        base_url: &str,
        timeout: Duration,
        storage: Box<dyn SessionStorage>,
    ) -> ApiResult<Self> {
        let client = build_http_client(timeout)?;
        let store = Arc::new(TokenStore::new(storage));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let refresher = Arc::new(HttpRefresher::new(client.clone(), base_url));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            refresher,
            events.clone(),
        ));
        let api = ApiClient::new(client, base_url, Arc::clone(&coordinator));

        Ok(Self {
            api,
            store,
            coordinator,
            events,
        })
    }

    /// Restore a persisted session at startup.
    ///
    /// Returns whether the session is usable afterwards. An expired access
    /// token is refreshed once if a refresh token is stored; without one the
    /// session is cleared and nothing is sent.
    pub async fn initialize(&self) -> bool {
        let (Some(access_token), Some(_user)) = (self.store.access_token(), self.store.user())
        else {
            debug!("No stored session");
            self.store.clear();
            return false;
        };

        if !token::is_expired(&access_token) {
            info!("Restored stored session");
            self.coordinator.schedule_renewal();
            let _ = self.events.send(SessionEvent::Established);
            return true;
        }

        if self.store.refresh_token().is_none() {
            debug!("Stored access token expired and no refresh token is available");
            self.store.clear();
            return false;
        }

        info!("Stored access token expired, refreshing");
        match self.coordinator.refresh().await {
            Ok(_) => {
                let _ = self.events.send(SessionEvent::Established);
                true
            }
            Err(e) => {
                warn!(error = %e, "Could not restore session");
                false
            }
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> ApiResult<LoginResponse> {
        let response = self.api.login(username, password).await?;

        // Replaces any previous session, including a refresh still in flight
        self.coordinator.end_session();
        if !self.store.set_tokens(&response.access_token, &response.refresh_token)
            || !self.store.set_user(&response.user)
        {
            warn!("Session could not be persisted");
            self.store.clear();
            return Err(ApiError::StorageFailed);
        }
        self.coordinator.schedule_renewal();

        info!(username = %response.user.username, "Login successful");
        let _ = self.events.send(SessionEvent::Established);
        Ok(response)
    }

    /// End the session. The server call is best effort; local state is always
    /// cleared.
    pub async fn logout(&self) {
        let access_token = self.store.access_token();
        if let Some(refresh_token) = self.store.refresh_token() {
            if let Err(e) = self.api.logout(access_token.as_deref(), &refresh_token).await {
                warn!(error = %e, "Server logout failed, clearing local session anyway");
            }
        }

        self.coordinator.end_session();
        info!("Logged out");
        let _ = self.events.send(SessionEvent::LoggedOut);
    }

    /// Fetch `/auth/me` and update the cached profile
    pub async fn fetch_current_user(&self) -> ApiResult<UserProfile> {
        let user = self.api.me().await?;
        self.store.set_user(&user);
        Ok(user)
    }

    /// Change the password. The server revokes the refresh token, so the
    /// local session ends and the user has to log in again.
    pub async fn change_password(&self, current_password: &str, new_password: &str) -> ApiResult<()> {
        self.api.change_password(current_password, new_password).await?;

        info!("Password changed, ending session");
        self.coordinator.end_session();
        let _ = self.events.send(SessionEvent::LoggedOut);
        Ok(())
    }

    pub async fn validate_token(&self, token: &str) -> ApiResult<TokenValidation> {
        self.api.validate_token(token).await
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.has_valid_session()
    }

    /// Cached profile, only while the session is valid
    pub fn user(&self) -> Option<UserProfile> {
        if self.is_authenticated() {
            self.store.user()
        } else {
            None
        }
    }

    /// Network-free permission check against the cached profile
    pub fn has_permission(&self, permission: &str) -> bool {
        self.user()
            .map(|u| u.has_permission(permission))
            .unwrap_or(false)
    }

    pub fn access_token_expires_in(&self) -> Option<f64> {
        self.store.access_token_expires_in()
    }

    pub fn pending_renewals(&self) -> usize {
        self.coordinator.scheduler().pending_timers()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Authorized client for resource endpoints
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // The timer task holds the coordinator; stop it with its session
        self.coordinator.scheduler().cancel();
    }
}
