//! Version listing, pruning and push retry commands.

use super::GlobalArgs;
use crate::manifest::VersionId;
use crate::pipeline::{RetryOutcome, SyncState};
use clap::Args;

/// Arguments for the versions command
#[derive(Args, Debug)]
pub struct VersionsArgs {
    /// Target whose versions to list
    pub target: String,

    /// Output format (json, summary)
    #[arg(long, default_value = "summary")]
    pub format: String,
}

/// Arguments for the prune command
#[derive(Args, Debug)]
pub struct PruneArgs {
    pub target: String,

    /// Version to remove; must be the newest
    pub version: String,
}

/// Arguments for the sync command
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Target to sync (all targets when omitted)
    pub target: Option<String>,

    /// Retry degraded entries and ignore backoff
    #[arg(long)]
    pub force: bool,
}

/// Run the versions command
pub async fn run(args: VersionsArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let engine = global.open_engine().await?;
    let versions = engine.list_versions(&args.target)?;

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&versions)?);
        return Ok(());
    }

    if versions.is_empty() {
        println!("No versions recorded for {}", args.target);
        return Ok(());
    }

    println!("Versions of {}:", args.target);
    for summary in &versions {
        let lineage = match &summary.parent_version_id {
            Some(_) => "incremental",
            None => "full",
        };
        let sync = match &summary.sync {
            None | Some(SyncState::Synced) => String::new(),
            Some(SyncState::Pending { attempts, .. }) => format!(" [push pending, {} attempts]", attempts),
            Some(SyncState::Degraded { attempts, .. }) => format!(" [push degraded after {} attempts]", attempts),
        };
        println!(
            "  {}  {}  {:<11}  {} files  +{} ~{} -{}{}",
            summary.version_id,
            summary.created.format("%Y-%m-%d %H:%M:%S"),
            lineage,
            summary.file_count,
            summary.changes.added,
            summary.changes.modified,
            summary.changes.deleted,
            sync
        );
    }
    Ok(())
}

/// Run the prune command
pub async fn prune(args: PruneArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let engine = global.open_engine().await?;
    let version = VersionId::parse(args.version)?;
    engine.prune(&args.target, &version)?;
    println!("Pruned {} from {}", version, args.target);
    Ok(())
}

/// Run the sync command
pub async fn sync(args: SyncArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let engine = global.open_engine().await?;
    let targets = match args.target {
        Some(target) => vec![target],
        None => engine.target_names(),
    };

    for target in &targets {
        if engine.pending_pushes(target)?.is_empty() {
            println!("{}: nothing to push", target);
            continue;
        }
        match engine.retry_pending(target, args.force).await? {
            RetryOutcome::Idle => println!("{}: no retry due yet (use --force)", target),
            RetryOutcome::Pushed { version_id, cleared } => {
                println!("{}: pushed {} ({} queued versions cleared)", target, version_id, cleared)
            }
            RetryOutcome::Failed {
                version_id,
                attempts,
                degraded,
                error,
            } => {
                println!(
                    "{}: push of {} failed (attempt {}{}): {}",
                    target,
                    version_id,
                    attempts,
                    if degraded { ", degraded" } else { "" },
                    error
                );
            }
        }
    }
    Ok(())
}
