//! theradash - participant and message sync for the monitoring dashboard

mod cli;
mod output;
mod snapshot;

use std::env;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cli::commands::{run_backfill, run_log, run_status, run_sync};
use cli::{Cli, Commands};
use output::OutputFormat;
use theradash_core::config::{SelectionMode, SyncConfig};

const MONITORED_ACCOUNTS_VAR: &str = "THERADASH_MONITORED_ACCOUNTS";

/// Logs go to stderr; stdout carries command output.
fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// The config file if one was given, otherwise defaults, plus any accounts
/// listed in `THERADASH_MONITORED_ACCOUNTS`.
fn load_config(path: Option<&Path>, mode: Option<SelectionMode>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(mode) = mode {
        config.selection_mode = mode;
    }
    if let Ok(accounts) = env::var(MONITORED_ACCOUNTS_VAR) {
        config.extend_monitored_accounts(&accounts);
    }
    Ok(config)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Commands::Sync { snapshot } => {
            let config = load_config(cli.config.as_deref(), cli.mode)?;
            if !run_sync(&cli.db, config, &snapshot, format)? {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Backfill {
            snapshot,
            dry_run,
            alerts,
        } => {
            let config = load_config(cli.config.as_deref(), cli.mode)?;
            run_backfill(&cli.db, config, &snapshot, dry_run, alerts, format)?;
        }

        Commands::Status => {
            run_status(&cli.db, format)?;
        }

        Commands::Log { limit } => {
            run_log(&cli.db, limit, format)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
