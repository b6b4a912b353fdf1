//! ScenarioSync daemon entry point.
//!
//! Loads configuration, opens the database, wires the git backend and the
//! credential vault into the sync orchestrator, serves the HTTP API and
//! handles graceful shutdown.

mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use scenariosync_core::config::AppConfig;
use scenariosync_core::credentials::DbCredentialVault;
use scenariosync_core::db::Database;
use scenariosync_core::git::Git2Repository;
use scenariosync_core::models::GitCredential;
use scenariosync_core::sync_engine::SyncOrchestrator;
use scenariosync_web::{AppState, WebServer};

/// User id under which the configured token is stored.
const SYSTEM_USER: &str = "system";

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// ScenarioSync API server.
#[derive(Parser, Debug)]
#[command(
    name = "scenariosync-daemon",
    version,
    about = "Scenario branching, merging and git sync server"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration file")?;
    config
        .validate()
        .context("configuration validation failed")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.server.log_level.clone());
    let _log_guard = init_tracing(&log_level, config.server.log_file.as_deref())?;

    info!("========================================");
    info!("  ScenarioSync Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Repository    : {}", config.git.repository_url);
    info!("Default branch: {}", config.git.default_branch);
    info!("Web listen    : {}", config.web.listen);
    info!("Data dir      : {}", config.server.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.server.data_dir)
        .context("failed to create data directory")?;

    let db_path = config.server.database_path();
    let db = Arc::new(Database::new(&db_path).context("failed to open database")?);
    db.initialize()
        .context("failed to initialize database schema")?;
    info!("Database initialized at {}", db_path.display());

    let mirror = config.server.git_mirror_path();
    let repo = Arc::new(Git2Repository::new(
        &mirror,
        &config.git.repository_url,
        &config.git.remote_name,
    ));
    info!("Git mirror at {}", mirror.display());

    let vault = Arc::new(DbCredentialVault::new(Arc::clone(&db)));
    if let Some(token) = config.git.token.as_deref() {
        seed_system_credential(&vault, &config, token)?;
    }

    let sync = Arc::new(SyncOrchestrator::new(
        Arc::clone(&db),
        repo,
        vault,
        config.git.clone(),
        &config.merge,
    ));

    let listen_addr = config.web.listen.clone();
    let server = WebServer::new(AppState::new(config, db, sync));
    server
        .start(&listen_addr, signals::wait_for_shutdown())
        .await
        .context("web server failed")?;

    info!("ScenarioSync daemon stopped.");
    Ok(())
}

/// Console logging, plus a daily-rolling file when `log_file` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir).context("failed to create log directory")?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "scenariosync.log".into());
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false),
        )
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Replace the `system` credential with the token from the environment.
fn seed_system_credential(vault: &DbCredentialVault, config: &AppConfig, token: &str) -> Result<()> {
    let url = &config.git.repository_url;
    let removed = vault
        .remove(SYSTEM_USER, url)
        .context("failed to clear previous system credential")?;
    if removed > 0 {
        info!(removed, "replacing stored system credential");
    }
    vault
        .store(&GitCredential {
            user_id: SYSTEM_USER.into(),
            provider: config.git.credential_provider.clone(),
            credential_type: "token".into(),
            token: token.to_string(),
            repository_url: url.clone(),
            expires_at: None,
            created_at: Utc::now(),
            last_used_at: None,
        })
        .context("failed to store system credential")?;
    info!(repository_url = %url, "seeded system git credential");
    Ok(())
}
