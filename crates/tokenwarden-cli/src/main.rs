//! tokenwarden - command-line front end for the session manager.
//!
//! Logs in against the identity provider, keeps the credential pair in the
//! configured store, and makes authorized requests that refresh the access
//! token transparently.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokenwarden_core::api::RegisterRequest;
use tokenwarden_core::{ApiClient, AuthManager, Config};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: tokenwarden <command>

Commands:
  login <email>                     Log in (prompts for password)
  register <email> <full name> <phone>
                                    Create an account and log in
  logout                            Forget stored credentials
  whoami                            Restore the session and print the identity
  status                            Show stored token state
  get <path>                        Authorized GET, prints the JSON response
";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (writer, guard) = tracing_appender::non_blocking(io::stderr());
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env()?;
    let auth = Arc::new(AuthManager::from_config(&config)?);
    info!(command = %command, base_url = %config.base_url, "tokenwarden starting");

    match (command.as_str(), &args[1..]) {
        ("login", [email]) => login(&auth, email).await,
        ("register", [email, full_name, phone]) => register(&auth, email, full_name, phone).await,
        ("logout", []) => {
            auth.logout()?;
            println!("Logged out");
            Ok(())
        }
        ("whoami", []) => whoami(&auth).await,
        ("status", []) => status(&auth),
        ("get", [path]) => get(&config, auth, path).await,
        _ => {
            eprint!("{}", USAGE);
            bail!("Unrecognized command: {}", args.join(" "))
        }
    }
}

async fn login(auth: &AuthManager, email: &str) -> Result<()> {
    let password = rpassword::prompt_password("Password: ")?;
    match auth.login(email, &password).await {
        Ok(_) => {
            let user = auth.session().user();
            println!(
                "Logged in as {} (user {})",
                user.username.as_deref().unwrap_or("?"),
                user.user_id.as_deref().unwrap_or("?")
            );
            Ok(())
        }
        Err(failure) => bail!("Login failed: {}", failure.message()),
    }
}

async fn register(auth: &AuthManager, email: &str, full_name: &str, phone: &str) -> Result<()> {
    let password = rpassword::prompt_password("Password: ")?;
    let password2 = rpassword::prompt_password("Confirm password: ")?;

    let request = RegisterRequest {
        full_name: full_name.to_string(),
        email: email.to_string(),
        phone: phone.to_string(),
        password,
        password2,
    };

    match auth.register(&request).await {
        Ok(created) => {
            println!("{}", serde_json::to_string_pretty(&created)?);
            if auth.session().is_authenticated() {
                println!("Registered and logged in");
            } else {
                println!("Registered; log in to continue");
            }
            Ok(())
        }
        Err(failure) => bail!("Registration failed: {}", failure.message()),
    }
}

async fn whoami(auth: &AuthManager) -> Result<()> {
    match auth.restore().await? {
        Some(identity) => println!("{}", serde_json::to_string_pretty(&identity)?),
        None => println!("Not logged in"),
    }
    Ok(())
}

fn status(auth: &AuthManager) -> Result<()> {
    let stored = auth.store().get()?;
    let access = match stored.access.as_deref() {
        None => "absent".to_string(),
        Some(token) => match auth.inspector().decode_claims(token) {
            Ok(claims) if !auth.inspector().is_expired(token) => {
                format!("valid (exp {})", claims.exp.unwrap_or_default())
            }
            Ok(_) => "stale".to_string(),
            Err(_) => "unreadable".to_string(),
        },
    };
    let refresh = if stored.refresh.is_some() { "present" } else { "absent" };

    println!("access:  {}", access);
    println!("refresh: {}", refresh);
    Ok(())
}

async fn get(config: &Config, auth: Arc<AuthManager>, path: &str) -> Result<()> {
    let client = ApiClient::new(config, auth)?;
    let body: serde_json::Value = client.get(path).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
