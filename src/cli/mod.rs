//! Command-line interface for AutoStash.
//!
//! Every command loads the configuration (writing defaults on first use),
//! opens an [`Engine`] over the configured targets and drives it.

use crate::config::Config;
use crate::engine::Engine;
use crate::logging;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod backup;
pub mod init;
pub mod restore;
pub mod schedule;
pub mod versions;

/// AutoStash - incremental personal backups into a versioned store
#[derive(Parser)]
#[command(name = "autostash")]
#[command(about = "Incremental personal backups with versioned, integrity-checked storage")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration file (default: <config dir>/autostash/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Back up one target (or all of them) now
    Backup(backup::BackupArgs),
    /// List recorded versions of a target
    Versions(versions::VersionsArgs),
    /// Restore a version into a destination directory
    Restore(restore::RestoreArgs),
    /// Verify the integrity of recorded versions
    Verify(restore::VerifyArgs),
    /// Remove the newest version of a target
    Prune(versions::PruneArgs),
    /// Retry pushes that failed to reach the remote
    Sync(versions::SyncArgs),
    /// Run the scheduler until interrupted
    Schedule(schedule::ScheduleArgs),
    /// Show when scheduled targets run next
    NextRun(schedule::NextRunArgs),
    /// Write a configuration file
    InitConfig(init::InitConfigArgs),
}

impl GlobalArgs {
    pub fn config_path(&self) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Ok(Config::default_path()?),
        }
    }

    pub fn load_config(&self) -> anyhow::Result<Config> {
        let path = self.config_path()?;
        Config::load_from(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    pub async fn open_engine(&self) -> anyhow::Result<Engine> {
        let config = self.load_config()?;
        Engine::open(config)
            .await
            .context("Failed to open backup targets")
    }

    /// Configure logging from the command line, falling back to the config file
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let logging_config = match self.config_path() {
            Ok(path) if path.exists() => Config::load_from(&path)
                .map(|c| c.logging)
                .unwrap_or_default(),
            _ => Default::default(),
        };

        match self.log_file.as_ref().or(logging_config.file.as_ref()) {
            Some(file) => logging::init_file_logging(file, self.verbose, &logging_config.level)?,
            None => logging::init_logging(self.verbose, &logging_config.level)?,
        }
        Ok(())
    }
}

/// Dispatch a parsed command line
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    cli.global.init_logging()?;

    match cli.command {
        Commands::Backup(args) => backup::run(args, &cli.global).await,
        Commands::Versions(args) => versions::run(args, &cli.global).await,
        Commands::Restore(args) => restore::run(args, &cli.global).await,
        Commands::Verify(args) => restore::verify(args, &cli.global).await,
        Commands::Prune(args) => versions::prune(args, &cli.global).await,
        Commands::Sync(args) => versions::sync(args, &cli.global).await,
        Commands::Schedule(args) => schedule::run(args, &cli.global).await,
        Commands::NextRun(args) => schedule::next_run(args, &cli.global).await,
        Commands::InitConfig(args) => init::run(args, &cli.global).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_restore_command() {
        let cli = Cli::try_parse_from([
            "autostash",
            "--config",
            "/tmp/autostash.toml",
            "restore",
            "docs",
            "--to",
            "/tmp/out",
            "--conflict",
            "rename",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(cli.global.config, Some(PathBuf::from("/tmp/autostash.toml")));
        match cli.command {
            Commands::Restore(args) => {
                assert_eq!(args.target, "docs");
                assert!(args.version.is_none());
                assert!(args.dry_run);
            }
            _ => panic!("expected restore"),
        }
    }

    #[test]
    fn test_parse_next_run_and_verbose() {
        let cli = Cli::try_parse_from(["autostash", "next-run", "-v"]).unwrap();
        assert!(cli.global.verbose);
        assert!(matches!(cli.command, Commands::NextRun(_)));
    }
}
