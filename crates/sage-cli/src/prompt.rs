use std::io::{self, Write};

use anyhow::Result;

/// Maximum length for username input.
/// Usernames may be email addresses; 255 matches the server-side limit.
const MAX_USERNAME_LENGTH: usize = 255;

/// Maximum length for password input.
const MAX_PASSWORD_LENGTH: usize = 100;

/// Minimum length the server accepts for a new password
const MIN_NEW_PASSWORD_LENGTH: usize = 8;

pub fn username(default: Option<&str>) -> Result<String> {
    match default {
        Some(last_user) => print!("Username [{}]: ", last_user),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    let username = match (input.is_empty(), default) {
        (true, Some(last_user)) => last_user.to_string(),
        _ => input.to_string(),
    };
    validate_username(&username)?;
    Ok(username)
}

pub fn password(label: &str) -> Result<String> {
    let password = rpassword::prompt_password(format!("{}: ", label))?;
    if password.is_empty() || password.len() > MAX_PASSWORD_LENGTH {
        anyhow::bail!("Password must be between 1 and {} characters", MAX_PASSWORD_LENGTH);
    }
    Ok(password)
}

fn validate_username(username: &str) -> Result<()> {
    if username.len() < 3 || username.len() > MAX_USERNAME_LENGTH {
        anyhow::bail!("Username must be between 3 and {} characters", MAX_USERNAME_LENGTH);
    }
    if username.chars().any(char::is_control) {
        anyhow::bail!("Username contains invalid characters");
    }
    Ok(())
}

/// Check a new password against the server's rules before sending it
pub fn validate_new_password(password: &str) -> Result<()> {
    if password.len() < MIN_NEW_PASSWORD_LENGTH {
        anyhow::bail!("New password must be at least {} characters", MIN_NEW_PASSWORD_LENGTH);
    }
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_upper && has_lower && has_digit) {
        anyhow::bail!("New password needs an uppercase letter, a lowercase letter and a digit");
    }
    Ok(())
}
