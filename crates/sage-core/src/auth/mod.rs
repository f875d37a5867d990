//! Authentication module for managing user sessions.
//!
//! This module provides:
//! - `TokenStore`: the persisted access token, refresh token and user profile
//! - `RefreshCoordinator`: single-flight token refresh shared by all requests
//! - `SessionScheduler`: renews the access token ahead of expiry
//! - `SessionManager`: login, logout and session restore on top of the above
//!
//! Storage backends are a JSON file directory, the OS keychain, or memory.

pub mod credentials;
pub mod events;
pub mod refresh;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod store;
pub mod token;
pub mod user;

pub use credentials::KeyringStorage;
pub use events::SessionEvent;
pub use refresh::{RefreshCoordinator, TokenPair, TokenRefresher};
pub use scheduler::SessionScheduler;
pub use session::SessionManager;
pub use storage::{FileStorage, MemoryStorage, SessionStorage};
pub use store::TokenStore;
pub use token::Claims;
pub use user::UserProfile;
