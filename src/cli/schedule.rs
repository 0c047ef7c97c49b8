//! Scheduler daemon and next-run commands.

use super::GlobalArgs;
use crate::scheduler::Scheduler;
use chrono::Utc;
use clap::Args;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Arguments for the schedule command
#[derive(Args, Debug)]
pub struct ScheduleArgs {}

/// Arguments for the next-run command
#[derive(Args, Debug)]
pub struct NextRunArgs {
    /// Target to show (all scheduled targets when omitted)
    pub target: Option<String>,
}

/// Run the scheduler until Ctrl-C
pub async fn run(_args: ScheduleArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let engine = Arc::new(global.open_engine().await?);
    let entries = engine.schedule_entries(Utc::now())?;
    if entries.is_empty() {
        println!("No scheduled targets. Add a [targets.schedule] section to the configuration.");
        return Ok(());
    }

    for entry in &entries {
        println!(
            "{}: {} (next run {})",
            entry.state.target,
            entry.state.frequency,
            entry.state.next_run.format("%Y-%m-%d %H:%M UTC")
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    Scheduler::new(engine, entries).run(shutdown_rx).await?;
    Ok(())
}

/// Print when scheduled targets run next
pub async fn next_run(args: NextRunArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let engine = global.open_engine().await?;
    let targets = match args.target {
        Some(target) => vec![target],
        None => engine.target_names(),
    };

    for target in &targets {
        match engine.next_run(target)? {
            Some(next) => println!("{}: {}", target, next.format("%Y-%m-%d %H:%M UTC")),
            None => println!("{}: not scheduled", target),
        }
    }
    Ok(())
}
