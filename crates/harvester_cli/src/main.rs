//! Harvester CLI - runs configured collection jobs and schema migrations.

mod commands;
mod config;
mod progress;
mod shutdown;

use clap::{Parser, Subcommand};
use console::Term;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harvester")]
#[command(version)]
#[command(about = "Rate-limited collector for paginated REST APIs")]
#[command(
    long_about = "Harvester pulls records from paginated REST APIs into raw tables, one \
JSON document per row, pacing requests to stay under the API's rate limit. \
Jobs with a creation-time field only fetch records newer than the last run."
)]
#[command(after_long_help = r#"EXAMPLES
    Create the raw tables for every configured job:
        $ harvester migrate up

    Run a job:
        $ harvester collect github_issues

    Re-collect an incremental job from scratch:
        $ harvester collect github_issues --full

    List configured jobs:
        $ harvester jobs

CONFIGURATION
    Harvester reads configuration from:
      1. ~/.config/harvester/config.toml (or $XDG_CONFIG_HOME/harvester/config.toml)
      2. ./harvester.toml
      3. Environment variables (HARVESTER_* prefix, nested keys joined with __)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    HARVESTER_DATABASE__URL                 Database connection string (default: ~/.local/state/harvester/harvester.db)
    HARVESTER_COLLECTOR__REQUESTS_PER_HOUR  Request ceiling shared by all workers
    HARVESTER_COLLECTOR__CONCURRENCY        Fan-out items collected in parallel
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Run a configured collection job
    Collect {
        /// Job name from the [jobs] config section
        job: String,

        #[command(flatten)]
        opts: CollectOptions,
    },
    /// List configured jobs
    Jobs,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Show migration status
    Status,
}

#[derive(Debug, Clone, clap::Args)]
struct CollectOptions {
    /// Discard previously collected rows of an incremental job and start over
    #[arg(short = 'f', long)]
    full: bool,

    /// Fan-out items collected in parallel (default from config or 5)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize tracing for non-TTY mode (structured logging)
    // Only initialize if not connected to a TTY
    if !Term::stdout().is_term() {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new("harvester=info,harvester_cli=info"),
        };

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    // Load configuration (config file -> env vars -> defaults)
    let config = config::Config::load();

    let cli = Cli::parse();

    if let Commands::Jobs = cli.command {
        commands::jobs::handle_jobs(&config);
        return Ok(());
    }

    let database_url = config
        .database_url()
        .ok_or("Could not determine a database URL; set database.url in harvester.toml")?;

    // Ensure the database directory exists for SQLite
    if database_url.starts_with("sqlite://") {
        let db_path = database_url.trim_start_matches("sqlite://");
        // Strip query parameters (e.g., ?mode=rwc) before path operations
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        let db_path = std::path::Path::new(db_path);

        // Warn if using a relative path (can cause issues depending on cwd)
        if db_path.is_relative() && !db_path.as_os_str().is_empty() {
            tracing::warn!(
                "Database path '{}' is relative - behavior depends on current directory. \
                 Consider using an absolute path.",
                db_path.display()
            );
        }

        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Set up graceful shutdown handler (Ctrl+C)
    let shutdown = shutdown::setup_shutdown_handler();

    match cli.command {
        Commands::Migrate { action } => {
            commands::migrate::handle_migrate(action, &config, &database_url, shutdown).await?;
        }
        Commands::Collect { job, opts } => {
            commands::collect::handle_collect(&job, opts, &config, &database_url, shutdown)
                .await?;
        }
        Commands::Jobs => {}
    }

    Ok(())
}
