//! SAGE CLI - command-line access to the SAGE patient-management API.
//!
//! Keeps a persistent session (login once, tokens renewed automatically) and
//! exposes a few commands to inspect and use it.

mod commands;
mod prompt;

use std::io;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sage_core::{Config, SessionManager};

const USAGE: &str = "\
Usage: sage <command>

Commands:
  login [username]     Log in and store the session
  logout               End the session
  status               Show whether a session is active
  whoami               Fetch the current user from the server
  change-password      Change your password (ends the session)
  get <path>           Authorized GET, prints the JSON response
  watch                Keep the session alive and print session events
";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    // `config` is what gets saved back; overrides only apply to this run
    let mut config = Config::load()?;
    let mut effective = config.clone();
    effective.apply_env_overrides();
    info!(api = %effective.api_base_url, command, "SAGE CLI starting");

    let session = SessionManager::from_config(&effective)?;

    match command {
        "login" => commands::login(&session, &mut config, args.get(2).cloned()).await,
        "logout" => commands::logout(&session).await,
        "status" => commands::status(&session).await,
        "whoami" => commands::whoami(&session).await,
        "change-password" => commands::change_password(&session).await,
        "get" => match args.get(2) {
            Some(path) => commands::get(&session, path).await,
            None => Err(anyhow::anyhow!("Usage: sage get <path>")),
        },
        "watch" => commands::watch(&session).await,
        "help" | "--help" | "-h" => {
            print!("{}", USAGE);
            Ok(())
        }
        other => {
            eprint!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}
