use anyhow::{Context, Result};
use chrono::Local;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use sage_core::auth::token;
use sage_core::{ApiError, Config, SessionEvent, SessionManager};

use crate::prompt;

/// Restore the stored session or fail with a hint to log in
async fn require_session(session: &SessionManager) -> Result<()> {
    if !session.initialize().await {
        anyhow::bail!("Not logged in. Run `sage login` first.");
    }
    Ok(())
}

/// Human-readable time left on the access token
fn format_remaining(seconds: f64) -> String {
    if seconds <= 0.0 {
        return "expired".to_string();
    }
    let total = seconds as i64;
    let at = Local::now() + chrono::Duration::seconds(total);
    let (minutes, secs) = (total / 60, total % 60);
    if minutes >= 60 {
        format!("{}h {}m (at {})", minutes / 60, minutes % 60, at.format("%H:%M"))
    } else if minutes > 0 {
        format!("{}m {}s (at {})", minutes, secs, at.format("%H:%M:%S"))
    } else {
        format!("{}s", secs)
    }
}

/// Point at `sage login` when the error means the session is gone
fn request_error(e: ApiError, action: &str) -> anyhow::Error {
    if e.requires_login() {
        anyhow::anyhow!("{}: {}. Run `sage login` to log in again.", action, e)
    } else {
        anyhow::Error::new(e).context(action.to_string())
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn login(
    session: &SessionManager,
    config: &mut Config,
    username: Option<String>,
) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => prompt::username(config.last_username.as_deref())?,
    };
    let password = prompt::password("Password")?;

    println!("Authenticating...");
    let response = match session.login(&username, &password).await {
        Ok(response) => response,
        Err(ApiError::InvalidCredentials) => anyhow::bail!("Invalid username or password"),
        Err(ApiError::NetworkError(e)) => {
            return Err(e).context("Unable to connect to server. Check the API URL.")
        }
        Err(e) => return Err(e).context("Login failed"),
    };

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Logged in as {}", response.user.display_name());
    Ok(())
}

pub async fn logout(session: &SessionManager) -> Result<()> {
    session.logout().await;
    println!("Logged out");
    Ok(())
}

pub async fn status(session: &SessionManager) -> Result<()> {
    if !session.initialize().await {
        println!("Not logged in");
        return Ok(());
    }

    if let Some(user) = session.user() {
        println!("Logged in as {} <{}>", user.display_name(), user.email);
        if !user.roles.is_empty() {
            println!("Roles: {}", user.roles.join(", "));
        }
    }
    if let Some(remaining) = session.access_token_expires_in() {
        println!("Access token expires in {}", format_remaining(remaining));
    }
    let claims = session.store().access_token().and_then(|t| token::decode(&t));
    if let Some(claims) = claims {
        if let (Some(issued), Some(expires)) = (claims.issued_at(), claims.expires_at()) {
            println!(
                "Token issued {}, valid until {}",
                issued.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                expires.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            );
        }
    }
    Ok(())
}

pub async fn whoami(session: &SessionManager) -> Result<()> {
    require_session(session).await?;
    let user = session
        .fetch_current_user()
        .await
        .map_err(|e| request_error(e, "Failed to fetch current user"))?;
    print_json(&serde_json::to_value(user)?)
}

pub async fn change_password(session: &SessionManager) -> Result<()> {
    require_session(session).await?;

    let current = prompt::password("Current password")?;
    let new = prompt::password("New password")?;
    prompt::validate_new_password(&new)?;
    let confirm = prompt::password("Confirm new password")?;
    if new != confirm {
        anyhow::bail!("Passwords do not match");
    }

    session
        .change_password(&current, &new)
        .await
        .map_err(|e| request_error(e, "Failed to change password"))?;
    println!("Password changed. Please log in again.");
    Ok(())
}

pub async fn get(session: &SessionManager, path: &str) -> Result<()> {
    require_session(session).await?;
    let value: Value = session
        .api()
        .get(path)
        .await
        .map_err(|e| request_error(e, &format!("GET {} failed", path)))?;
    print_json(&value)
}

/// Block until Ctrl-C, printing session events. Renewal runs in the
/// background while this waits.
pub async fn watch(session: &SessionManager) -> Result<()> {
    let mut events = session.subscribe();
    require_session(session).await?;
    println!("Session active. Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Refreshed) => {
                    let remaining = session.access_token_expires_in().unwrap_or(0.0);
                    println!("Token renewed, expires in {}", format_remaining(remaining));
                }
                Ok(SessionEvent::Expired) => {
                    anyhow::bail!("Session expired. Run `sage login` to log in again.");
                }
                Ok(SessionEvent::LoggedOut) => {
                    println!("Logged out");
                    return Ok(());
                }
                Ok(SessionEvent::Established) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Missed session events"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
