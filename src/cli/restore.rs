//! Restore and verify commands.

use super::GlobalArgs;
use crate::manifest::VersionId;
use crate::pipeline::{ConflictPolicy, RestoreOptions};
use clap::{Args, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConflictArg {
    Overwrite,
    Skip,
    Rename,
}

impl From<ConflictArg> for ConflictPolicy {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Overwrite => ConflictPolicy::Overwrite,
            ConflictArg::Skip => ConflictPolicy::Skip,
            ConflictArg::Rename => ConflictPolicy::Rename,
        }
    }
}

/// Arguments for the restore command
#[derive(Args, Debug)]
pub struct RestoreArgs {
    pub target: String,

    /// Version to restore (latest when omitted)
    #[arg(long)]
    pub version: Option<String>,

    /// Destination directory
    #[arg(long)]
    pub to: PathBuf,

    /// Allow restoring into a watched directory
    #[arg(long)]
    pub in_place: bool,

    /// What to do with files already present at the destination
    #[arg(long, value_enum, default_value = "overwrite")]
    pub conflict: ConflictArg,

    /// Verify and plan without writing
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the verify command
#[derive(Args, Debug)]
pub struct VerifyArgs {
    pub target: String,

    /// Verify a single version instead of the whole chain
    #[arg(long)]
    pub version: Option<String>,
}

/// Run the restore command
pub async fn run(args: RestoreArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let engine = global.open_engine().await?;

    let version = match args.version {
        Some(version) => VersionId::parse(version)?,
        None => engine
            .list_versions(&args.target)?
            .pop()
            .map(|summary| summary.version_id)
            .ok_or_else(|| anyhow::anyhow!("No versions recorded for {}", args.target))?,
    };
    let options = RestoreOptions {
        allow_in_place: args.in_place,
        conflict_policy: args.conflict.into(),
        dry_run: args.dry_run,
    };

    println!("Restoring {} of {} -> {}", version, args.target, args.to.display());
    let result = engine
        .restore_blocking(&args.target, &version, &args.to, &options)
        .await?;

    if result.dry_run {
        println!("Dry run: {} files would be restored", result.restored.len());
    } else {
        println!("Restore completed successfully!");
        println!("  Files restored: {}", result.restored.len());
        println!("  Bytes written: {}", result.bytes_written);
    }
    if !result.skipped.is_empty() {
        println!("  Skipped existing: {}", result.skipped.len());
    }
    for (original, written) in &result.renamed {
        println!("  {} -> {}", original.display(), written.display());
    }
    Ok(())
}

/// Run the verify command
pub async fn verify(args: VerifyArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let engine = global.open_engine().await?;

    if let Some(version) = args.version {
        let report = engine
            .verify(&args.target, &VersionId::parse(version)?)
            .await?;
        if report.passed {
            println!("✓ {} verified", report.version_id);
            return Ok(());
        }
        println!("✗ {} failed verification", report.version_id);
        for path in &report.mismatched {
            println!("  mismatched: {}", path.display());
        }
        for problem in &report.problems {
            println!("  {}", problem);
        }
        anyhow::bail!("verification failed");
    }

    let report = engine.verify_all(&args.target).await?;
    println!(
        "{}: {} of {} versions verified",
        args.target, report.passed, report.total
    );
    for failed in &report.failed {
        println!("✗ {}", failed.version_id);
        for path in &failed.mismatched {
            println!("  mismatched: {}", path.display());
        }
        for problem in &failed.problems {
            println!("  {}", problem);
        }
    }
    for broken in &report.chain_breaks {
        println!("✗ {} chain broken: {}", broken.version_id, broken.reason);
    }

    if !report.is_healthy() {
        anyhow::bail!("verification found problems");
    }
    Ok(())
}
