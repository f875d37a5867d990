//! End-to-end session tests against an in-process fake of the SAGE `/auth` API.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::future::join_all;
use serde_json::{json, Value};

use sage_core::auth::{MemoryStorage, SessionStorage};
use sage_core::{ApiError, SessionEvent, SessionManager, UserProfile};

const PASSWORD: &str = "Admin123!";

fn unsigned_token(exp: i64, jti: usize) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let now = chrono::Utc::now().timestamp();
    let payload = URL_SAFE_NO_PAD.encode(
        json!({
            "sub": "1",
            "username": "admin",
            "exp": exp,
            "iat": now,
            "jti": jti.to_string(),
            "type": "access",
        })
        .to_string(),
    );
    format!("{}.{}.sig", header, payload)
}

fn user_json() -> Value {
    json!({
        "id": 1,
        "username": "admin",
        "email": "admin@sage.test",
        "full_name": "Administrador SAGE",
        "roles": ["admin"],
        "permissions": ["*"],
        "is_superuser": true,
        "is_active": true,
        "last_login": null
    })
}

#[derive(Default)]
struct Backend {
    issued: AtomicUsize,
    current_access: Mutex<String>,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    refresh_fails: AtomicBool,
    reject_everything: AtomicBool,
    full_name: Mutex<Option<String>>,
}

impl Backend {
    fn issue(&self) -> String {
        let jti = self.issued.fetch_add(1, Ordering::SeqCst);
        let token = unsigned_token(chrono::Utc::now().timestamp() + 1800, jti);
        *self.current_access.lock().unwrap() = token.clone();
        token
    }

    /// Server-side revocation: the client still believes its token is valid
    fn revoke_current(&self) {
        *self.current_access.lock().unwrap() = "revoked".to_string();
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        if self.reject_everything.load(Ordering::SeqCst) {
            return false;
        }
        let expected = format!("Bearer {}", self.current_access.lock().unwrap());
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == expected)
            .unwrap_or(false)
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"detail": "No autorizado"}))).into_response()
}

async fn login(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    if body["password"] != PASSWORD {
        return unauthorized();
    }
    Json(json!({
        "access_token": backend.issue(),
        "refresh_token": "refresh-1",
        "token_type": "bearer",
        "expires_in": 1800,
        "user": user_json(),
    }))
    .into_response()
}

async fn refresh(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    if backend.refresh_fails.load(Ordering::SeqCst) || body["refresh_token"] != "refresh-1" {
        return unauthorized();
    }
    Json(json!({
        "access_token": backend.issue(),
        "token_type": "bearer",
        "expires_in": 1800,
    }))
    .into_response()
}

async fn logout(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    backend.logout_calls.fetch_add(1, Ordering::SeqCst);
    assert_eq!(body["refresh_token"], "refresh-1");
    Json(json!({"message": "Logout exitoso", "tokens_invalidated": 2})).into_response()
}

async fn me(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    let mut user = user_json();
    if let Some(name) = backend.full_name.lock().unwrap().clone() {
        user["full_name"] = json!(name);
    }
    Json(user).into_response()
}

async fn change_password(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"message": "Contraseña actualizada exitosamente"})).into_response()
}

async fn validate(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    let valid = body["token"] == *backend.current_access.lock().unwrap();
    Json(json!({
        "valid": valid,
        "expired": false,
        "blacklisted": !valid,
        "user_id": if valid { json!(1) } else { Value::Null },
        "expires_at": null,
        "message": if valid { "Token válido" } else { "Token revocado" },
    }))
    .into_response()
}

async fn patients(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!([{"id": 1, "nombre": "Paciente Demo"}])).into_response()
}

async fn spawn_backend() -> (Arc<Backend>, String) {
    let backend = Arc::new(Backend::default());
    let app = Router::new()
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        .route("/api/v1/auth/me", get(me))
        .route("/api/v1/auth/change-password", post(change_password))
        .route("/api/v1/auth/validate", post(validate))
        .route("/api/v1/patients", get(patients))
        .with_state(Arc::clone(&backend));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (backend, format!("http://{}/api/v1", addr))
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Storage that cannot write refresh tokens
#[derive(Default)]
struct ReadOnlyRefresh(MemoryStorage);

impl SessionStorage for ReadOnlyRefresh {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.0.get(key)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        if key == "refresh_token" {
            anyhow::bail!("permission denied");
        }
        self.0.set(key, value)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.0.remove(key)
    }
}

fn session_for(base_url: &str) -> SessionManager {
    SessionManager::new(base_url, Duration::from_secs(5), Box::new(MemoryStorage::new())).unwrap()
}

#[tokio::test]
async fn test_login_persists_session_and_user() {
    let (_backend, url) = spawn_backend().await;
    let session = session_for(&url);

    let response = session.login("admin", PASSWORD).await.unwrap();

    assert!(session.store().has_valid_session());
    assert_eq!(session.store().user(), Some(response.user.clone()));
    assert_eq!(session.store().refresh_token().as_deref(), Some("refresh-1"));
    assert!(session.has_permission("audit.read"));
    assert_eq!(session.pending_renewals(), 1);
}

#[tokio::test]
async fn test_relogin_keeps_a_single_renewal_timer() {
    let (_backend, url) = spawn_backend().await;
    let session = session_for(&url);

    session.login("admin", PASSWORD).await.unwrap();
    session.login("admin", PASSWORD).await.unwrap();
    settle().await;
    assert_eq!(session.pending_renewals(), 1);

    session.logout().await;
    settle().await;
    assert_eq!(session.pending_renewals(), 0);

    session.login("admin", PASSWORD).await.unwrap();
    settle().await;
    assert_eq!(session.pending_renewals(), 1);
}

#[tokio::test]
async fn test_login_with_wrong_password() {
    let (_backend, url) = spawn_backend().await;
    let session = session_for(&url);

    let result = session.login("admin", "wrong").await;

    assert!(matches!(result, Err(ApiError::InvalidCredentials)));
    assert!(!session.is_authenticated());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unauthorized_requests_share_one_refresh() {
    let (backend, url) = spawn_backend().await;
    let session = session_for(&url);
    session.login("admin", PASSWORD).await.unwrap();
    backend.revoke_current();

    let results = join_all((0..12).map(|_| session.api().get::<Value>("/patients"))).await;

    assert_eq!(backend.refresh_calls(), 1);
    for result in results {
        let patients = result.unwrap();
        assert_eq!(patients[0]["id"], 1);
    }
    assert!(session.is_authenticated());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_refresh_fails_every_request_and_clears_session() {
    let (backend, url) = spawn_backend().await;
    let session = session_for(&url);
    session.login("admin", PASSWORD).await.unwrap();
    let mut events = session.subscribe();
    backend.revoke_current();
    backend.refresh_fails.store(true, Ordering::SeqCst);

    let results = join_all((0..6).map(|_| session.api().get::<Value>("/patients"))).await;

    assert_eq!(backend.refresh_calls(), 1);
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(ApiError::SessionExpired))));
    assert!(!session.is_authenticated());
    assert_eq!(session.store().refresh_token(), None);
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
}

#[tokio::test]
async fn test_second_unauthorized_after_refresh_is_terminal() {
    let (backend, url) = spawn_backend().await;
    let session = session_for(&url);
    session.login("admin", PASSWORD).await.unwrap();
    backend.reject_everything.store(true, Ordering::SeqCst);

    let result = session.api().get::<Value>("/patients").await;

    assert!(matches!(result, Err(ApiError::SessionExpired)));
    assert_eq!(backend.refresh_calls(), 1);
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn test_startup_with_expired_access_token_refreshes_once() {
    let (backend, url) = spawn_backend().await;
    let session = session_for(&url);
    let expired = unsigned_token(chrono::Utc::now().timestamp() - 10, 999);
    session.store().set_tokens(&expired, "refresh-1");
    let user: UserProfile = serde_json::from_value(user_json()).unwrap();
    session.store().set_user(&user);

    assert!(session.initialize().await);

    assert_eq!(backend.refresh_calls(), 1);
    assert!(session.is_authenticated());
    assert_ne!(session.store().access_token().as_deref(), Some(expired.as_str()));
    // The server kept the refresh token
    assert_eq!(session.store().refresh_token().as_deref(), Some("refresh-1"));
    assert_eq!(session.pending_renewals(), 1);
}

#[tokio::test]
async fn test_startup_without_refresh_token_does_not_touch_network() {
    let (backend, url) = spawn_backend().await;
    let session = session_for(&url);
    let expired = unsigned_token(chrono::Utc::now().timestamp() - 10, 999);
    // Simulate a half-written legacy session: access token only
    session.store().set_tokens(&expired, "");
    let user: UserProfile = serde_json::from_value(user_json()).unwrap();
    session.store().set_user(&user);

    assert!(!session.initialize().await);

    assert_eq!(backend.refresh_calls(), 0);
    assert!(!session.is_authenticated());
    assert_eq!(session.store().access_token(), None);
    assert_eq!(session.store().user(), None);
}

#[tokio::test]
async fn test_fetch_current_user_updates_cache() {
    let (backend, url) = spawn_backend().await;
    let session = session_for(&url);
    session.login("admin", PASSWORD).await.unwrap();
    *backend.full_name.lock().unwrap() = Some("Admin Renombrado".to_string());

    let user = session.fetch_current_user().await.unwrap();

    assert_eq!(user.display_name(), "Admin Renombrado");
    assert_eq!(session.user().unwrap().display_name(), "Admin Renombrado");
}

#[tokio::test]
async fn test_logout_invalidates_remotely_and_clears_locally() {
    let (backend, url) = spawn_backend().await;
    let session = session_for(&url);
    session.login("admin", PASSWORD).await.unwrap();

    session.logout().await;

    assert_eq!(backend.logout_calls.load(Ordering::SeqCst), 1);
    assert!(!session.is_authenticated());
    assert_eq!(session.store().refresh_token(), None);
}

#[tokio::test]
async fn test_change_password_ends_session() {
    let (_backend, url) = spawn_backend().await;
    let session = session_for(&url);
    session.login("admin", PASSWORD).await.unwrap();
    let mut events = session.subscribe();

    session.change_password(PASSWORD, "Nueva123!").await.unwrap();

    assert!(!session.is_authenticated());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
}

#[tokio::test]
async fn test_validate_token_reports_revocation() {
    let (backend, url) = spawn_backend().await;
    let session = session_for(&url);
    session.login("admin", PASSWORD).await.unwrap();
    let token = session.store().access_token().unwrap();

    let report = session.validate_token(&token).await.unwrap();
    assert!(report.valid);
    assert!(!report.blacklisted);

    backend.revoke_current();
    let report = session.validate_token(&token).await.unwrap();
    assert!(!report.valid);
    assert!(report.blacklisted);
}

#[tokio::test]
async fn test_login_fails_when_session_cannot_be_stored() {
    let (_backend, url) = spawn_backend().await;
    let session = SessionManager::new(
        &url,
        Duration::from_secs(5),
        Box::new(ReadOnlyRefresh::default()),
    )
    .unwrap();
    let mut events = session.subscribe();

    let result = session.login("admin", PASSWORD).await;

    assert!(matches!(result, Err(ApiError::StorageFailed)));
    assert!(!session.is_authenticated());
    assert_eq!(session.store().access_token(), None);
    assert_eq!(session.pending_renewals(), 0);
    assert!(events.try_recv().is_err());
}
