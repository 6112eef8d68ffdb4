//! sessiongate - sign in to an API backend and use the session from the terminal.
//!
//! The session is kept between runs (session file or OS keychain) and
//! renewed transparently when the backend reports it expired.

mod navigator;

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessiongate_core::api::{ApiClient, ApiError};
use sessiongate_core::auth::{
    CredentialStore, FileStorage, GateOutcome, Policy, PolicyMode, ReturnIntentTracker,
    SessionGate, SignInFlow,
};
use sessiongate_core::config::StorageBackend;
use sessiongate_core::Config;

use navigator::TerminalNavigator;

/// Log file name prefix inside the cache directory
const LOG_FILE_PREFIX: &str = "sessiongate.log";

const USAGE: &str = "Usage: sessiongate <command>

Commands:
  login [email]                       Sign in and store the session
  logout                              Sign out and forget the session
  status                              Show the stored session
  whoami                              Fetch the signed-in user's profile
  get <path>                          Authenticated GET, printed as JSON
  open <path> [redirect|prompt|fallback]
                                      Visit a protected page through the sign-in gate";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr and to a daily file in `log_dir`. The returned guard
/// flushes the file writer and must live until exit.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(filter)
        .init();

    guard
}

/// Everything a command needs, wired once at startup.
struct App {
    config: Config,
    store: CredentialStore,
    client: ApiClient,
    navigator: Arc<TerminalNavigator>,
    gate: SessionGate,
    flow: SignInFlow,
}

impl App {
    fn new(config: Config) -> Result<Self> {
        let store = CredentialStore::open(config.open_storage()?);
        let client = ApiClient::new(&config.api_base_url, config.request_timeout(), store.clone())
            .context("Failed to create API client")?;
        let intents = ReturnIntentTracker::new();
        let navigator = Arc::new(TerminalNavigator::new(&config.landing_path));
        let gate = SessionGate::new(store.clone(), intents.clone(), navigator.clone())
            .with_sign_in_path(&config.sign_in_path);
        let flow = SignInFlow::new(store.clone(), intents, navigator.clone())
            .with_landing_path(&config.landing_path);

        Ok(Self {
            config,
            store,
            client,
            navigator,
            gate,
            flow,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    let cache_dir = config.cache_dir()?;
    std::fs::create_dir_all(&cache_dir)?;
    let _log_guard = init_tracing(&cache_dir.join("logs"));
    info!(api = %config.api_base_url, storage = ?config.storage, "sessiongate starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut app = App::new(config)?;
    let result = match command.as_str() {
        "login" => login(&mut app, args.get(1).map(String::as_str)).await.map(|_| ()),
        "logout" => {
            app.flow.sign_out();
            println!("Signed out.");
            Ok(())
        }
        "status" => status(&app),
        "whoami" => whoami(&app).await,
        "get" => match args.get(1) {
            Some(path) => get(&app, path).await,
            None => Err(anyhow::anyhow!("get needs a path\n\n{}", USAGE)),
        },
        "open" => match args.get(1) {
            Some(path) => {
                let mode = args.get(2).map(String::as_str).unwrap_or("redirect").parse()?;
                open(&mut app, path, mode).await
            }
            None => Err(anyhow::anyhow!("open needs a path\n\n{}", USAGE)),
        },
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    };

    info!("sessiongate exiting");
    result
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Interactive login. Returns the path the sign-in flow navigated to.
async fn login(app: &mut App, email: Option<&str>) -> Result<String> {
    let email = match email.map(str::to_string).or_else(|| app.config.last_username.clone()) {
        Some(email) if !email.is_empty() => email,
        _ => prompt_line("Email: ")?,
    };
    if email.is_empty() {
        anyhow::bail!("Email required");
    }
    let password = rpassword::prompt_password(format!("Password for {}: ", email))?;
    if password.is_empty() {
        anyhow::bail!("Password required");
    }

    let session = match app.client.login(&email, &password).await {
        Ok(session) => session,
        Err(ApiError::Unauthorized) => anyhow::bail!("Login failed: invalid email or password"),
        Err(e) => {
            warn!(error = %e, "Login failed");
            anyhow::bail!("Login failed: {}", e.user_message());
        }
    };

    let name = session.user().map(|u| u.display_name.clone()).unwrap_or_default();
    let path = app.flow.complete(session);
    println!("Signed in as {}.", name);

    app.config.last_username = Some(email);
    if let Err(e) = app.config.save() {
        warn!(error = %e, "Failed to save config");
    }
    Ok(path)
}

fn status(app: &App) -> Result<()> {
    let Some(session) = app.store.session() else {
        println!("Not signed in.");
        return Ok(());
    };

    match session.user() {
        Some(user) => {
            let role = if user.is_vendor { " (vendor)" } else { "" };
            println!("Signed in as {} <{}>{}", user.display_name, user.email, role);
        }
        None => println!("Signed in (profile not loaded, run `sessiongate whoami`)"),
    }
    println!(
        "Refresh credential: {}",
        if session.refresh_credential().is_some() { "yes" } else { "no" }
    );
    if app.config.storage == StorageBackend::File {
        let storage = FileStorage::new(app.config.cache_dir()?);
        if let Some(age) = storage.age_display()? {
            println!("Session saved {}", age);
        }
    }
    Ok(())
}

async fn whoami(app: &App) -> Result<()> {
    match app.client.refresh_profile().await {
        Ok(user) => {
            println!("{} <{}> (id {})", user.display_name, user.email, user.id);
            Ok(())
        }
        Err(e) => Err(report(e)),
    }
}

async fn get(app: &App, path: &str) -> Result<()> {
    let mut proceed = false;
    let outcome = app
        .gate
        .authorize(&format!("view {}", path), || proceed = true, Policy::Prompt)?;

    match outcome {
        GateOutcome::Proceeded if proceed => fetch_and_print(app, path).await,
        GateOutcome::Prompt(prompt) => {
            println!("{}", prompt.title);
            println!("{}", prompt.message);
            println!("Run `sessiongate login` first.");
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn open(app: &mut App, path: &str, mode: PolicyMode) -> Result<()> {
    app.navigator.visit(path);

    let mut proceed = false;
    let policy = match mode {
        PolicyMode::Prompt => Policy::Prompt,
        PolicyMode::Redirect => Policy::Redirect,
        PolicyMode::Fallback => Policy::fallback(|| println!("Browsing {} as a guest.", path)),
    };
    let outcome = app
        .gate
        .authorize(&format!("view {}", path), || proceed = true, policy)?;

    match outcome {
        GateOutcome::Proceeded if proceed => fetch_and_print(app, path).await,
        GateOutcome::Redirected { .. } => {
            let resumed = login(app, None).await?;
            fetch_and_print(app, &resumed).await
        }
        GateOutcome::Prompt(prompt) => {
            println!("{}", prompt.title);
            let answer = prompt_line("Sign in now? [y/N] ")?;
            if answer.eq_ignore_ascii_case("y") {
                login(app, None).await?;
                // Prompts do not queue the action; run it again ourselves
                fetch_and_print(app, path).await
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

async fn fetch_and_print(app: &App, path: &str) -> Result<()> {
    match app.client.get_json::<serde_json::Value>(path).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => Err(report(e)),
    }
}

fn report(e: ApiError) -> anyhow::Error {
    warn!(error = %e, "Request failed");
    if matches!(e, ApiError::SessionExpired) {
        anyhow::anyhow!("{} (session expired, run `sessiongate login`)", e.user_message())
    } else {
        anyhow::anyhow!("{}: {}", e.user_message(), e)
    }
}
