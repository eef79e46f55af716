mod config;
mod serve_cmd;
mod status_cmd;
mod task_cmds;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mnemo_db::pool;

use config::MnemoConfig;

#[derive(Parser)]
#[command(name = "mnemo", about = "Task broker and worker coordinator for the mnemo memory service")]
struct Cli {
    /// Database URL (overrides MNEMO_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/mnemo")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database if needed and run migrations
    DbInit,
    /// Run the broker (worker hub, dispatcher, HTTP surface)
    Serve,
    /// Show task counts by status
    Status,
    /// Task queue operations
    Task {
        #[command(subcommand)]
        command: task_cmds::TaskCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            let path = config::config_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            let mut file = config::ConfigFile::default();
            file.database.url = Some(db_url);
            config::save_config(&file)?;
            println!("wrote {}", path.display());
            Ok(())
        }

        Commands::DbInit => {
            let config = MnemoConfig::resolve(cli.database_url.as_deref())?;
            pool::ensure_database_exists(&config.db_config).await?;
            let pg_pool = pool::create_pool(&config.db_config).await?;
            pool::run_migrations(&pg_pool, pool::default_migrations_path()).await?;
            pg_pool.close().await;
            println!("database initialized at {}", config.db_config.database_url);
            Ok(())
        }

        Commands::Serve => {
            let config = MnemoConfig::resolve(cli.database_url.as_deref())?;
            serve_cmd::run(config).await
        }

        Commands::Status => {
            let config = MnemoConfig::resolve(cli.database_url.as_deref())?;
            status_cmd::run(&config).await
        }

        Commands::Task { command } => {
            let config = MnemoConfig::resolve(cli.database_url.as_deref())?;
            task_cmds::run(&config, command).await
        }
    }
}
