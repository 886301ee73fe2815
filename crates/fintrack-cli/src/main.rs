//! fintrack - command-line access to a fintrack account.
//!
//! Signs in, signs up (waiting for email verification), shows and refreshes
//! the stored session, checks premium access and signs out. Session state is
//! shared with any other fintrack client using the same cache directory.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use fintrack_core::auth::verification::VERIFICATION_POLL_INTERVAL;
use fintrack_core::auth::SignUpOutcome;
use fintrack_core::{AppContext, Config, Session};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable consulted before prompting for a password
const PASSWORD_ENV: &str = "FINTRACK_PASSWORD";

/// Default time to wait for email verification, in seconds
const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 600;

#[derive(Parser)]
#[command(name = "fintrack", version, about = "fintrack account and session tool")]
struct Cli {
    /// Write logs to a daily file in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an account and wait for email verification
    Signup {
        #[arg(long)]
        email: String,
        /// Seconds to wait for the verification link to be clicked
        #[arg(long, default_value_t = DEFAULT_VERIFY_TIMEOUT_SECS)]
        timeout: u64,
    },
    /// Resume waiting for email verification after sign-up
    Verify {
        #[arg(long, default_value_t = DEFAULT_VERIFY_TIMEOUT_SECS)]
        timeout: u64,
        /// Abandon verification and erase the cached credentials
        #[arg(long)]
        cancel: bool,
    },
    /// Show the current session, refreshing it if close to expiry
    Status {
        /// Also fetch the user from the auth service
        #[arg(long)]
        remote: bool,
    },
    /// Force a session refresh
    Refresh,
    /// Sign out and erase local session state
    Logout,
    /// Check premium access (lifetime grant or subscription)
    Premium,
    /// Keep the session fresh until interrupted
    Watch {
        /// Seconds between validity checks
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fintrack.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
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

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());
    info!("fintrack starting");

    let mut config = Config::load()?;
    let backend = config.backend()?;
    let cache_dir = config.cache_dir()?;

    let mut ctx = AppContext::new(&backend, &cache_dir)?;
    ctx.start_listener();

    let result = run(cli.command, &ctx, &mut config).await;

    ctx.shutdown();
    result
}

async fn run(command: Command, ctx: &AppContext, config: &mut Config) -> Result<()> {
    match command {
        Command::Login { email } => login(ctx, config, email).await,
        Command::Signup { email, timeout } => signup(ctx, config, email, timeout).await,
        Command::Verify { timeout, cancel } => {
            if cancel {
                ctx.sessions.cancel_email_verification().await;
                println!("Verification cancelled.");
                Ok(())
            } else {
                wait_for_verification(ctx, timeout).await
            }
        }
        Command::Status { remote } => status(ctx, remote).await,
        Command::Refresh => {
            let Some(session) = ctx.sessions.get_session().await else {
                println!("Not signed in.");
                return Ok(());
            };
            match ctx.sessions.refresh_session(session).await {
                Some(session) => print_session(&session),
                None => println!("Session could not be refreshed. Sign in again."),
            }
            Ok(())
        }
        Command::Logout => {
            if ctx.sessions.sign_out().await {
                println!("Signed out.");
            } else {
                println!("Signed out, but some local state could not be erased (see logs).");
            }
            Ok(())
        }
        Command::Premium => {
            let access = ctx.premium_access().await;
            let rendered =
                serde_json::to_string_pretty(&access).context("Failed to format output")?;
            println!("{}", rendered);
            Ok(())
        }
        Command::Watch { interval } => watch(ctx, interval).await,
    }
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

fn remember_email(config: &mut Config, email: &str) {
    config.last_email = Some(email.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

async fn login(ctx: &AppContext, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt_line("Email: ")?,
    };
    if email.is_empty() {
        anyhow::bail!("Email required");
    }
    let password = read_password()?;

    let session = ctx
        .sessions
        .sign_in(&email, &password)
        .await
        .context("Sign-in failed")?;
    remember_email(config, &email);

    println!("Signed in as {}.", email);
    print_session(&session);
    Ok(())
}

async fn signup(ctx: &AppContext, config: &mut Config, email: String, timeout: u64) -> Result<()> {
    let password = read_password()?;
    let outcome = ctx
        .sessions
        .sign_up(&email, &password)
        .await
        .context("Sign-up failed")?;
    remember_email(config, &email);

    match outcome {
        SignUpOutcome::SignedIn(session) => {
            println!("Account created and signed in.");
            print_session(&session);
            Ok(())
        }
        SignUpOutcome::VerificationPending(_) => {
            println!("Please verify your account with the message we just sent to {}.", email);
            wait_for_verification(ctx, timeout).await
        }
    }
}

async fn wait_for_verification(ctx: &AppContext, timeout: u64) -> Result<()> {
    println!("Waiting for verification (Ctrl-C to stop)...");
    let wait = ctx
        .sessions
        .wait_for_email_verification(VERIFICATION_POLL_INTERVAL);

    match tokio::time::timeout(Duration::from_secs(timeout), wait).await {
        Ok(Ok(session)) => {
            println!("Email verified, signed in.");
            print_session(&session);
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            println!("Still not verified. Run `fintrack verify` once you have clicked the link.");
            Ok(())
        }
    }
}

async fn status(ctx: &AppContext, remote: bool) -> Result<()> {
    let Some(session) = ctx.sessions.ensure_valid_session().await else {
        println!("Not signed in.");
        return Ok(());
    };
    print_session(&session);

    if remote {
        let user = ctx
            .auth
            .get_user(&session.access_token)
            .await
            .context("Failed to fetch user")?;
        println!(
            "Remote user: {} ({}), email {}",
            user.email.as_deref().unwrap_or("-"),
            user.id,
            if user.is_email_confirmed() { "confirmed" } else { "unconfirmed" }
        );
    }
    Ok(())
}

async fn watch(ctx: &AppContext, interval: u64) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopped.");
                return Ok(());
            }
            _ = ticker.tick() => {
                match ctx.sessions.ensure_valid_session().await {
                    Some(session) => info!(
                        minutes_left = session.minutes_until_expiry(),
                        "Session valid"
                    ),
                    None => {
                        println!("Session ended. Sign in again.");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn print_session(session: &Session) {
    let user = session
        .user
        .as_ref()
        .and_then(|u| u.email.as_deref())
        .or_else(|| session.user_id())
        .unwrap_or("unknown user");
    let expires = session
        .expires_at_utc()
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "Session for {} valid until {} ({} min left)",
        user,
        expires,
        session.minutes_until_expiry()
    );
}
