mod logging;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tally_config::{AppConfig, ConfigLoader};
use tally_db::{MigrationRunner, Store, app_catalog};
use tracing::error;

#[derive(Parser)]
#[command(name = "tally", version, about = "Apply and inspect tally schema migrations")]
struct Cli {
    /// Path to config file (yml or toml)
    #[arg(short, long, global = true, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overrides the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply all pending migrations
    Migrate {
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show the applied and pending migrations without changing anything
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log);

    match run(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = ConfigLoader::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    Ok(config)
}

fn run(command: Command, config: &AppConfig) -> Result<()> {
    let catalog = app_catalog().context("invalid migration catalog")?;
    if matches!(command, Command::Status { .. }) && !config.database.path.exists() {
        println!(
            "{}: no database at {}, {} migration(s) pending",
            config.database.label,
            config.database.path.display(),
            catalog.len()
        );
        return Ok(());
    }

    match command {
        Command::Migrate { timeout } => {
            let store = Store::open(&config.database)
                .with_context(|| format!("{} database init failed", config.database.label))?;
            let mut runner = MigrationRunner::new();
            if let Some(limit) = timeout.map(Duration::from_secs).or(config.migrations.deadline()) {
                runner = runner.with_deadline(limit);
            }
            let report = store
                .migrate(&catalog, &runner)
                .context("database migration failed")?;
            report::print_migration(store.label(), &report);
        }
        Command::Status { json } => {
            let store = Store::open_read_only(&config.database)
                .with_context(|| format!("failed to open {} database", config.database.label))?;
            let status = store.status(&catalog).context("failed to read schema status")?;
            if json {
                let encoded =
                    serde_json::to_string_pretty(&status).context("failed to encode status")?;
                println!("{encoded}");
            } else {
                report::print_status(store.label(), &status);
            }
        }
    }
    Ok(())
}
