//! Token store: the three persisted session fields over a storage backend.
//!
//! Storage failures never escape this module. They are logged and a failed
//! read behaves like a missing value, so a broken backend looks like an empty
//! session instead of an error the caller has to handle.

use tracing::{debug, warn};

use super::storage::SessionStorage;
use super::token;
use super::user::UserProfile;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USER_KEY: &str = "user";

pub struct TokenStore {
    backend: Box<dyn SessionStorage>,
}

impl TokenStore {
    pub fn new(backend: Box<dyn SessionStorage>) -> Self {
        Self { backend }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(key = key, error = %e, "Failed to read session entry");
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) -> bool {
        match self.backend.set(key, value) {
            Ok(()) => true,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to write session entry");
                false
            }
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.backend.remove(key) {
            warn!(key = key, error = %e, "Failed to remove session entry");
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    /// Persist a token pair. Returns false if the pair could not be stored,
    /// in which case both tokens are removed: a half-written pair never stays
    /// behind.
    pub fn set_tokens(&self, access_token: &str, refresh_token: &str) -> bool {
        if self.write(ACCESS_TOKEN_KEY, access_token)
            && self.write(REFRESH_TOKEN_KEY, refresh_token)
        {
            return true;
        }
        self.clear_tokens();
        false
    }

    pub fn clear_tokens(&self) {
        self.remove(ACCESS_TOKEN_KEY);
        self.remove(REFRESH_TOKEN_KEY);
    }

    pub fn user(&self) -> Option<UserProfile> {
        let raw = self.read(USER_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Stored user profile is unreadable");
                None
            }
        }
    }

    pub fn set_user(&self, user: &UserProfile) -> bool {
        match serde_json::to_string(user) {
            Ok(raw) => self.write(USER_KEY, &raw),
            Err(e) => {
                warn!(error = %e, "Failed to serialize user profile");
                false
            }
        }
    }

    pub fn clear_user(&self) {
        self.remove(USER_KEY);
    }

    /// Remove every session field
    pub fn clear(&self) {
        debug!("Clearing stored session");
        self.clear_tokens();
        self.clear_user();
    }

    /// Access token present and not expired
    pub fn has_valid_session(&self) -> bool {
        self.access_token()
            .map(|t| !token::is_expired(&t))
            .unwrap_or(false)
    }

    /// Seconds until the stored access token expires, None without a token
    pub fn access_token_expires_in(&self) -> Option<f64> {
        self.access_token().map(|t| token::expires_in_seconds(&t))
    }
}
