//! Core library for the SAGE client.
//!
//! Session handling for the SAGE patient-management API: persisted tokens,
//! proactive renewal, and a request client that transparently refreshes an
//! expired access token once per request.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiResult};
pub use auth::{SessionEvent, SessionManager, UserProfile};
pub use config::Config;
