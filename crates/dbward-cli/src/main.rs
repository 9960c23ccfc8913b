mod commands;
mod prompt;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dbward_config::ConfigLoader;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbward", version, about = "Schema migrations, backups and restores")]
struct Cli {
    /// Path to config file (dbward.yml, .yaml or .toml)
    #[arg(short, long, global = true, env = "DBWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Target database file, overriding the configured location
    #[arg(long, global = true)]
    database_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the database, its bookkeeping tables and working directories
    Init,
    /// Apply pending migrations, optionally stopping at TARGET
    #[command(alias = "up")]
    Migrate {
        /// Last version to apply
        target: Option<String>,
    },
    /// Show applied, failed and pending migrations and the lock holder
    Status,
    /// Take a compressed snapshot of the database
    Backup {
        /// Backup name (defaults to a timestamped one)
        name: Option<String>,
    },
    /// Replace the database with a backup
    Restore { name: String },
    /// Check a backup's archive against its metadata
    Verify { name: String },
    /// List backups, newest first
    List,
    /// Delete all but the newest KEEP backups
    Cleanup {
        /// Number of backups to keep (defaults to keep_count)
        keep: Option<usize>,
    },
    /// Drop every object in the database after a safety backup
    Reset,
    /// Create a new migration file from the template
    Generate { name: String },
    /// Probe the database once
    Check,
    /// Probe the database until it is ready
    Wait {
        /// Seconds to wait (defaults to readiness.timeout_secs)
        timeout: Option<u64>,
    },
    /// Clear the migration lock left behind by a dead process
    Unlock,
}

fn main() -> ExitCode {
    // Variables from .env must be visible to clap's `env` lookups.
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            e.print().ok();
            return usage_exit_code(&e);
        }
    };
    init_tracing(cli.verbose, cli.log_format);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `--help` and `--version` succeed; every other parse error is a failure.
fn usage_exit_code(error: &clap::Error) -> ExitCode {
    if error.use_stderr() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = ConfigLoader::new(cli.config)
        .load()
        .context("failed to load configuration")?;
    if let Some(path) = cli.database_path {
        config.database_path = Some(path);
    }
    commands::dispatch(&config, cli.command)
}
