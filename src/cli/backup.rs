//! Backup command implementation.

use super::GlobalArgs;
use crate::pipeline::{RunOutcome, SyncState};
use clap::Args;

/// Arguments for the backup command
#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Target to back up (all targets when omitted)
    pub target: Option<String>,

    /// Print outcomes as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the backup command
pub async fn run(args: BackupArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let engine = global.open_engine().await?;
    let targets = match args.target {
        Some(target) => vec![target],
        None => engine.target_names(),
    };
    if targets.is_empty() {
        println!("No targets configured. Add one to the configuration file first.");
        return Ok(());
    }

    let mut failures = 0;
    for target in &targets {
        match engine.backup_blocking(target).await {
            Ok(outcome) if args.json => println!("{}", serde_json::to_string_pretty(&outcome)?),
            Ok(outcome) => print_outcome(target, &outcome),
            Err(e) => {
                eprintln!("Backup of {} failed ({}): {}", target, e.kind(), e);
                for path in e.paths() {
                    eprintln!("  {}", path.display());
                }
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} backups failed", failures, targets.len());
    }
    Ok(())
}

fn print_outcome(target: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Recorded {
            summary,
            sync,
            scan_warnings,
        } => {
            println!("Backup of {} completed successfully!", target);
            println!("  Version: {}", summary.version_id);
            println!(
                "  Changes: +{} ~{} -{}",
                summary.changes.added, summary.changes.modified, summary.changes.deleted
            );
            println!("  Files: {} ({} bytes)", summary.file_count, summary.total_size);
            if *scan_warnings > 0 {
                println!("  Skipped entries: {}", scan_warnings);
            }
            match sync {
                SyncState::Synced => {}
                SyncState::Pending { last_error, .. } => {
                    println!("  Push pending: {}", last_error)
                }
                SyncState::Degraded { last_error, .. } => {
                    println!("  Push degraded: {}", last_error)
                }
            }
        }
        RunOutcome::NoChanges => println!("{}: no changes since the last backup", target),
        RunOutcome::AlreadyRunning => println!("{}: a backup is already running", target),
    }
}
