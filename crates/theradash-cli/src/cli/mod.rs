//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use theradash_core::config::SelectionMode;

pub mod commands;

/// Participant and message sync for the theradash monitoring dashboard
#[derive(Parser, Debug)]
#[command(name = "theradash")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the local sync database
    #[arg(long, global = true, env = "THERADASH_DB", default_value = ".theradash/sync.db")]
    pub db: PathBuf,

    /// Path to the JSON sync configuration (defaults apply when omitted)
    #[arg(long, global = true, env = "THERADASH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the configured participant selection mode
    #[arg(long, global = true, value_enum, env = "THERADASH_SELECTION_MODE")]
    pub mode: Option<SelectionMode>,

    /// Output format: text (default) or JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one full sync: reconcile, ingest, alert, advance the watermark
    Sync {
        /// Directory of JSON exports standing in for the registry and event store
        #[arg(long, env = "THERADASH_SNAPSHOT")]
        snapshot: PathBuf,
    },

    /// Fill gaps from the full event-store history
    Backfill {
        /// Directory of JSON exports standing in for the registry and event store
        #[arg(long, env = "THERADASH_SNAPSHOT")]
        snapshot: PathBuf,

        /// Only report what is missing
        #[arg(long, conflicts_with = "alerts")]
        dry_run: bool,

        /// Send alerts for every risky message never alerted, instead of ingesting
        #[arg(long)]
        alerts: bool,
    },

    /// Show the run lock, watermark, last run and table counts
    Status,

    /// Show recent sync runs, newest first
    Log {
        /// Number of runs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backfill_flags() {
        let cli = Cli::try_parse_from([
            "theradash",
            "--db",
            "/tmp/x.db",
            "backfill",
            "--snapshot",
            "/tmp/snap",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.db, PathBuf::from("/tmp/x.db"));
        match cli.command {
            Commands::Backfill {
                snapshot,
                dry_run,
                alerts,
            } => {
                assert_eq!(snapshot, PathBuf::from("/tmp/snap"));
                assert!(dry_run);
                assert!(!alerts);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_dry_run_conflicts_with_alerts() {
        let parsed = Cli::try_parse_from([
            "theradash",
            "backfill",
            "--snapshot",
            "/tmp/snap",
            "--dry-run",
            "--alerts",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_log_limit_default() {
        let cli = Cli::try_parse_from(["theradash", "log", "--json", "--mode", "all"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.mode, Some(SelectionMode::All));
        assert!(matches!(cli.command, Commands::Log { limit: 20 }));
    }
}
