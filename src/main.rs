//! AutoStash - incremental personal backups
//!
//! Main binary entry point for the command-line interface.

use clap::Parser;
use autostash::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli::run(cli).await
}
