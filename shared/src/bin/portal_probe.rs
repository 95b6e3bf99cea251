//! Diagnostic client for the portal backend.
//!
//! - `resolve`: run endpoint discovery and print the winning base URL
//! - `health`: probe every candidate host and report which ones answer
//! - `login`: sign in and keep the session in the local store
//! - `me`: restore the stored session and refresh it from `/me`
//! - `documents`: list the signed-in user's document requests
//! - `logout`: drop the stored session
//!
//! `RUST_LOG` controls log output (default `info`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use portal_shared::capabilities::{Capabilities, MemoryKvStore, ReqwestShell, SqliteKvStore};
use portal_shared::resolver::Candidate;
use portal_shared::{AppError, ClientConfig, PortalClient, StatusOutcome, UserFacingError};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "portal-probe", about = "Probe and exercise the employee portal backend")]
struct Cli {
    /// JSON file with a `ClientConfig`; flags below override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Candidate host to try, in order. Repeat for several.
    #[arg(long = "host", global = true)]
    hosts: Vec<String>,

    #[arg(long, global = true)]
    port: Option<u16>,

    /// SQLite file for the session and last working address. In-memory when absent.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Resolve,
    Health,
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Me,
    Documents,
    Logout,
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ClientConfig::from_json(&raw)?
        }
        None => ClientConfig::default(),
    };
    if !cli.hosts.is_empty() {
        config.candidate_hosts = cli.hosts.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

fn capabilities(db: Option<&PathBuf>) -> Result<Capabilities> {
    let http = Arc::new(ReqwestShell::new()?);
    let caps = match db {
        Some(path) => Capabilities::new(http, Arc::new(SqliteKvStore::open(path)?)),
        None => Capabilities::new(http, Arc::new(MemoryKvStore::new())),
    };
    Ok(caps)
}

/// Maps a client error to the message a user would see, keeping the code.
fn explain(error: impl Into<AppError>) -> anyhow::Error {
    let error: AppError = error.into();
    let view = UserFacingError::from(&error);
    debug!(error = %error, "command failed");
    anyhow::anyhow!("{} [{}]", view.message, view.error_code)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let caps = capabilities(cli.db.as_ref())?;
    let client = PortalClient::new(&caps, config)?;

    match cli.command {
        Command::Resolve => {
            let endpoint = client.resolver().resolve().await.map_err(explain)?;
            println!("{} (via {:?})", endpoint.base_url, endpoint.source);
        }
        Command::Health => {
            let config = client.config();
            let mut reachable = 0usize;
            for host in &config.candidate_hosts {
                let candidate = Candidate::new(host.as_str(), config.port);
                let ok = client.resolver().probe(&candidate).await;
                if ok {
                    reachable += 1;
                }
                println!("{:<6} {}", if ok { "ok" } else { "down" }, candidate.health_url());
            }
            if reachable == 0 {
                bail!("no candidate answered /health");
            }
        }
        Command::Login { email, password } => {
            let session = client
                .auth()
                .login(&email, &password)
                .await
                .map_err(explain)?;
            println!("signed in as {} ({})", session.user().full_name(), session.user_id());
        }
        Command::Me => match client.start().await.map_err(explain)? {
            Some(session) => {
                let user = session.user();
                println!("{} <{}>", user.full_name(), user.email);
                if let Some(department) = &user.department {
                    println!("department: {department}");
                }
                if let Some(position) = &user.position {
                    println!("position:   {position}");
                }
            }
            None => println!("not signed in"),
        },
        Command::Documents => {
            let requests = client.documents().list().await.map_err(explain)?;
            if requests.is_empty() {
                println!("no document requests");
            }
            for request in requests {
                let outcome = match request.status.outcome() {
                    StatusOutcome::Open(stage) => stage.label().to_string(),
                    StatusOutcome::Rejected => "refusé".to_string(),
                    StatusOutcome::Delivered => "livré".to_string(),
                };
                println!(
                    "{:<26} {:<12} {}",
                    request.document_type,
                    outcome,
                    request.created_at.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Logout => {
            client.auth().logout().await.map_err(explain)?;
            println!("signed out");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    run(Cli::parse()).await
}
