//! civicdesk - terminal front end for the civic services portal session.
//!
//! Logs in against the portal backend, reports session state, issues
//! authenticated requests and watches the token until it expires.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use civicdesk_core::api::{ApiClient, ApiError, Navigator, LOGIN_ROUTE};
use civicdesk_core::auth::{AuthContext, ExpiryWatcher, SessionManager, SessionState};
use civicdesk_core::config::Config;

/// Log file written to the cache directory
const LOG_FILE: &str = "civicdesk.log";

#[derive(Parser)]
#[command(name = "civicdesk", version, about = "Civic services portal session client")]
struct Cli {
    /// Backend base URL (overrides config)
    #[arg(long, global = true, env = "CIVICDESK_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session token
    Login {
        /// Email or phone number; defaults to the last one used
        identifier: Option<String>,
    },
    /// Clear the stored session
    Logout,
    /// Show session state and time remaining
    Status,
    /// Print the signed-in user
    Whoami,
    /// GET an API path with the session token and print the JSON
    Get { path: String },
    /// Check the session periodically until it ends
    Watch,
}

/// Terminal stand-in for a browser redirect
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn redirect(&self, route: &str) {
        if route == LOGIN_ROUTE {
            eprintln!("Session ended. Run `civicdesk login` to sign in again.");
        } else {
            eprintln!("Redirect: {}", route);
        }
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file = config.cache_dir().ok().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        Some(tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE)))
    });

    match file {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

fn prompt_identifier(default: Option<&str>) -> Result<String> {
    match default {
        Some(d) => print!("Email or phone [{}]: ", d),
        None => print!("Email or phone: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();
    match (input.is_empty(), default) {
        (true, Some(d)) => Ok(d.to_string()),
        (true, None) => Err(anyhow::anyhow!("Identifier required")),
        (false, _) => Ok(input.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = Config::load().context("Failed to load config")?;
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }

    let _log_guard = init_tracing(&config);
    info!(api = %config.api_base_url, storage = ?config.storage, "civicdesk starting");

    let store = config.open_store()?;
    let session = Arc::new(SessionManager::new(store));
    let api = ApiClient::new(&config.api_base_url, session, Arc::new(TerminalNavigator))?;
    let ctx = AuthContext::new(api, &config.token_lifetime);

    match cli.command {
        Command::Login { identifier } => login(&ctx, &mut config, identifier).await,
        Command::Logout => {
            ctx.logout().await;
            println!("Logged out.");
            Ok(())
        }
        Command::Status => {
            print_status(&ctx);
            Ok(())
        }
        Command::Whoami => {
            match ctx.restore() {
                Some(user) => println!("{} - {}", user.display_name(), user.role.label()),
                None => println!("Not logged in."),
            }
            Ok(())
        }
        Command::Get { path } => get(&ctx, &path).await,
        Command::Watch => watch(&ctx, &config).await,
    }
}

async fn login(ctx: &AuthContext, config: &mut Config, identifier: Option<String>) -> Result<()> {
    let identifier = match identifier {
        Some(id) => id,
        None => prompt_identifier(config.last_identifier.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ")?;
    if password.is_empty() {
        return Err(anyhow::anyhow!("Password required"));
    }

    match ctx.login(&identifier, &password).await {
        Ok(user) => {
            config.last_identifier = Some(identifier);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
            println!("Welcome, {}. Home: {}", user.display_name(), user.role.home_route());
            print_status(ctx);
            Ok(())
        }
        Err(ApiError::InvalidCredentials) => Err(anyhow::anyhow!("Invalid email/phone or password")),
        Err(ApiError::NetworkError(e)) => {
            Err(anyhow::anyhow!("Unable to reach {}: {}", ctx.api().base_url(), e))
        }
        Err(e) => Err(e).context("Login failed"),
    }
}

fn print_status(ctx: &AuthContext) {
    let status = ctx.status();
    let label = match status.state {
        SessionState::Unauthenticated => "logged out",
        SessionState::Valid => "active",
        SessionState::Expiring => "expiring soon",
        SessionState::Expired => "expired",
    };
    println!("Session: {}", label);
    if let Some(expires_at) = status.expires_at {
        println!(
            "Expires: {} ({} left)",
            expires_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
            status.remaining_display()
        );
    }
    if let Some(user) = status.user {
        println!("User:    {} ({})", user.display_name(), user.role.label());
    }
}

async fn get(ctx: &AuthContext, path: &str) -> Result<()> {
    if !ctx.is_authenticated() {
        eprintln!("Not logged in; sending request without a token.");
    }
    let value: serde_json::Value = ctx
        .api()
        .get_json(path)
        .await
        .with_context(|| format!("GET {} failed", path))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn watch(ctx: &AuthContext, config: &Config) -> Result<()> {
    let watcher = ExpiryWatcher::spawn(ctx.session().clone(), config.check_interval());
    let mut rx = watcher.subscribe();
    let mut last = watcher.current();
    println!("Watching session (every {}s). Ctrl+C to stop.", config.check_interval().as_secs());
    print_status(ctx);

    while last.is_authenticated() {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *rx.borrow_and_update();
                if state != last {
                    if state == SessionState::Expiring {
                        println!("Session expires in {}.", ctx.status().remaining_display());
                    }
                    last = state;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                return Ok(());
            }
        }
    }

    watcher.stop();
    println!("Session ended. Run `civicdesk login` to sign in again.");
    Ok(())
}
