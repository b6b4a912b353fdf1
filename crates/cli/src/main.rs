//! ScenarioSync command-line management tool.
//!
//! Works directly on the daemon's database: inspect and branch scenarios,
//! compare them, merge and resolve conflicts, read change history, export
//! and import scenario data, manage git credentials and run git sync.

mod commands;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scenariosync_core::config::AppConfig;
use scenariosync_core::db::Database;
use scenariosync_core::git::Git2Repository;
use scenariosync_core::{
    ChangeHistoryLog, ConflictResolver, DbCredentialVault, DiffEngine, MergeCoordinator,
    ScenarioExporter, ScenarioGraph, SyncOrchestrator,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// ScenarioSync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "scenariosync",
    version,
    about = "Branch, merge and sync capacity-planning scenarios"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/scenariosync/config.toml"
    )]
    config: PathBuf,

    /// User id recorded on operations, resolutions and history.
    #[arg(short, long, global = true, default_value = "cli")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./scenariosync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Create and inspect scenarios.
    Scenarios {
        #[command(subcommand)]
        action: ScenariosAction,
    },

    /// Show the field-level differences between two scenarios.
    Compare {
        /// Scenario to compare from.
        from: String,
        /// Scenario to compare to.
        to: String,
        /// Include unchanged entities.
        #[arg(long)]
        all: bool,
    },

    /// Merge scenarios into their parents.
    Merge {
        #[command(subcommand)]
        action: MergeAction,
    },

    /// List and resolve merge or pull conflicts.
    Conflicts {
        #[command(subcommand)]
        action: ConflictsAction,
    },

    /// Show change history of a scenario or of one entity.
    History {
        /// Scenario id (ignored when --entity-type/--entity-id are given).
        #[arg(long)]
        scenario: Option<String>,
        /// Entity type: project, person, assignment, project_phase.
        #[arg(long, requires = "entity_id")]
        entity_type: Option<String>,
        #[arg(long, requires = "entity_type")]
        entity_id: Option<String>,
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
        /// Cursor printed by a previous page.
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Write a scenario's data as JSON.
    Export {
        scenario: String,
        /// Output file (stdout when omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace a scenario's data from an export file.
    Import {
        scenario: String,
        /// Export file to read.
        input: PathBuf,
    },

    /// Manage git credentials.
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },

    /// Synchronize scenarios with the git remote.
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScenariosAction {
    /// List scenarios.
    List {
        /// Include archived scenarios.
        #[arg(long)]
        all: bool,
    },
    /// Create a root baseline, or branch from --parent.
    Create {
        name: String,
        #[arg(long)]
        parent: Option<String>,
        /// custom, optimistic, pessimistic, what-if, forecast.
        #[arg(long = "type", default_value = "what-if")]
        scenario_type: String,
    },
    /// Move a draft scenario to active.
    Activate { id: String },
    /// Archive a scenario without live children.
    Archive { id: String },
    /// Show the ancestors of a scenario, nearest first.
    Ancestors { id: String },
}

#[derive(Subcommand, Debug)]
pub enum MergeAction {
    /// Merge a scenario into its parent.
    Run { scenario: String },
    /// Retry a merge after resolving its conflicts.
    Retry { operation_id: String },
    /// Abandon a merge that stopped on conflicts.
    Abandon { operation_id: String },
}

#[derive(Subcommand, Debug)]
pub enum ConflictsAction {
    /// List conflicts of an operation, or open conflicts of a scenario.
    List {
        #[arg(long, conflicts_with = "scenario")]
        operation: Option<String>,
        #[arg(long)]
        scenario: Option<String>,
    },
    /// Record a decision for a conflict.
    Resolve {
        id: String,
        /// accept_local, accept_remote or custom.
        #[arg(long)]
        strategy: String,
        /// JSON value for the custom strategy.
        #[arg(long)]
        value: Option<String>,
    },
    /// Defer a conflict.
    Defer { id: String },
}

#[derive(Subcommand, Debug)]
pub enum CredentialsAction {
    /// Store a git token for a user.
    Add {
        /// User the token belongs to (defaults to --user).
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        token: String,
        /// Days until the token expires.
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// List the credentials of a user (tokens are not shown).
    List {
        #[arg(long)]
        owner: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SyncAction {
    /// Clone the remote into the root baseline.
    Clone,
    /// Pull a scenario's branch.
    Pull { scenario: String },
    /// Push a scenario to its branch.
    Push { scenario: String },
    /// Finish a pull that stopped on conflicts.
    Resume { operation_id: String },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    // Minimal logging for CLI
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let user = cli.user.as_str();
    match cli.command {
        Commands::Init { output } => commands::init(&output),
        Commands::Validate => commands::validate(&cli.config),
        command => {
            let services = Services::open(&cli.config)?;
            match command {
                Commands::Scenarios { action } => commands::scenarios(&services, action, user),
                Commands::Compare { from, to, all } => {
                    commands::compare(&services, &from, &to, all)
                }
                Commands::Merge { action } => commands::merge(&services, action, user),
                Commands::Conflicts { action } => commands::conflicts(&services, action, user),
                Commands::History {
                    scenario,
                    entity_type,
                    entity_id,
                    limit,
                    cursor,
                } => commands::history(
                    &services,
                    scenario.as_deref(),
                    entity_type.as_deref().zip(entity_id.as_deref()),
                    limit,
                    cursor.as_deref(),
                ),
                Commands::Export { scenario, output } => {
                    commands::export(&services, &scenario, output.as_deref(), user)
                }
                Commands::Import { scenario, input } => {
                    commands::import(&services, &scenario, &input, user)
                }
                Commands::Credentials { action } => commands::credentials(&services, action, user),
                Commands::Sync { action } => commands::sync(&services, action, user).await,
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Every core service over the configured database.
pub struct Services {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub graph: ScenarioGraph,
    pub diff: DiffEngine,
    pub merges: MergeCoordinator,
    pub resolver: ConflictResolver,
    pub history: ChangeHistoryLog,
    pub exporter: ScenarioExporter,
    pub vault: Arc<DbCredentialVault>,
}

impl Services {
    fn open(config_path: &Path) -> Result<Self> {
        let config =
            AppConfig::load_and_resolve(config_path).context("failed to load configuration file")?;
        let db_path = config.server.database_path();
        let db = Arc::new(Database::new(&db_path).context("failed to open database")?);
        db.initialize().context("failed to initialize database")?;
        Ok(Self::with_database(config, db))
    }

    pub fn with_database(config: AppConfig, db: Arc<Database>) -> Self {
        let depth = config.merge.max_hierarchy_depth;
        Self {
            graph: ScenarioGraph::new(Arc::clone(&db), depth, &config.git.default_branch),
            diff: DiffEngine::new(Arc::clone(&db), depth),
            merges: MergeCoordinator::new(
                Arc::clone(&db),
                config.merge.lock_stale_after_secs,
                depth,
            ),
            resolver: ConflictResolver::new(Arc::clone(&db)),
            history: ChangeHistoryLog::new(Arc::clone(&db)),
            exporter: ScenarioExporter::new(Arc::clone(&db), depth),
            vault: Arc::new(DbCredentialVault::new(Arc::clone(&db))),
            db,
            config,
        }
    }

    /// A sync orchestrator over the libgit2 mirror in `data_dir`.
    pub fn sync(&self) -> SyncOrchestrator {
        let repo = Git2Repository::new(
            self.config.server.git_mirror_path(),
            &self.config.git.repository_url,
            &self.config.git.remote_name,
        );
        SyncOrchestrator::new(
            Arc::clone(&self.db),
            Arc::new(repo),
            self.vault.clone(),
            self.config.git.clone(),
            &self.config.merge,
        )
    }
}
