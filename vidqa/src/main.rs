//! vidqa - video question-answering session synchronizer
//!
//! Headless host driver and maintenance commands.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/vidqa/state.db (~/.local/share/vidqa/state.db)
//! - Logs: $XDG_STATE_HOME/vidqa/vidqa.log (~/.local/state/vidqa/vidqa.log)
//! - Config: $XDG_CONFIG_HOME/vidqa/config.toml (~/.config/vidqa/config.toml)

mod driver;
mod render;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use vidqa_core::format::format_relative_time;
use vidqa_core::{Config, Database, PageLocation, ServiceClient, SessionStore};

#[derive(Parser)]
#[command(name = "vidqa")]
#[command(about = "Per-video conversations with a question-answering service")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive the synchronizer from commands on stdin
    Run {
        /// Print the projected view as JSON after each command
        #[arg(long)]
        json: bool,
    },

    /// List stored sessions, most recent first
    Sessions,

    /// Show configuration, paths and service reachability
    Status,

    /// Move a legacy single conversation into a session
    Migrate {
        /// Page the legacy conversation belongs to
        #[arg(long)]
        url: String,

        /// Title for the new session
        #[arg(long, default_value = "")]
        title: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        vidqa_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("vidqa starting");

    let store = open_store()?;

    match args.command {
        Command::Run { json } => driver::run(&config, store, json).await,
        Command::Sessions => list_sessions(&store),
        Command::Status => show_status(&config, &store).await,
        Command::Migrate { url, title } => migrate(&store, url, title),
    }
}

fn open_store() -> Result<SessionStore> {
    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening database");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(SessionStore::new(Arc::new(db)))
}

fn list_sessions(store: &SessionStore) -> Result<()> {
    let sessions = store.list().context("failed to list sessions")?;
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    let active = store.active_session_id()?;
    println!("{:<2} {:<14} {:>8}  {:<12} TITLE", "", "VIDEO", "MESSAGES", "ACTIVE");
    for session in sessions {
        let marker = if active.as_ref() == Some(&session.content_id) {
            "*"
        } else {
            ""
        };
        println!(
            "{:<2} {:<14} {:>8}  {:<12} {}",
            marker,
            session.content_id,
            session.conversation.len(),
            format_relative_time(session.updated_at),
            session.title
        );
    }
    Ok(())
}

async fn show_status(config: &Config, store: &SessionStore) -> Result<()> {
    println!("vidqa Status");
    println!("============");
    println!("Config:          {}", Config::config_path().display());
    println!("Database:        {}", Config::database_path().display());
    println!("Log:             {}", Config::log_path().display());
    println!("Service:         {}", config.service.base_url);

    let client = ServiceClient::new(&config.service).context("failed to create service client")?;
    let reachable = client.health_check().await;
    println!(
        "Reachable:       {}",
        if reachable { "yes" } else { "no" }
    );

    let state = store.snapshot().context("failed to read state")?;
    println!("Sessions:        {}", state.sessions.len());
    println!(
        "Active session:  {}",
        state
            .active_session_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("Indexing:        {}", state.indexing_status);
    if let Some(err) = state.last_error {
        println!("Last error:      {}", err.message);
    }
    Ok(())
}

fn migrate(store: &SessionStore, url: String, title: String) -> Result<()> {
    let outcome = store
        .migrate_legacy(&PageLocation::new(url, title))
        .context("failed to migrate legacy conversation")?;
    println!("{}", render::migration(&outcome));
    Ok(())
}
