//! REST API client module for the SAGE backend.
//!
//! This module provides the `ApiClient` for communicating with the SAGE
//! patient-management API and the typed bodies of its `/auth` endpoints.
//!
//! The API uses JWT bearer token authentication obtained through
//! `POST /auth/login` and renewed through `POST /auth/refresh`.

pub mod client;
pub mod error;
pub mod models;

pub use client::{build_http_client, ApiClient, HttpRefresher, REQUEST_TIMEOUT_SECS};
pub use error::{ApiError, ApiResult};
pub use models::{LoginResponse, TokenValidation};
