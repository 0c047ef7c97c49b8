//! Init-config command implementation.

use super::GlobalArgs;
use crate::config::{Config, RepositoryConfig, ScheduleConfig, TargetConfig};
use clap::Args;
use std::path::PathBuf;

/// Arguments for the init-config command
#[derive(Args, Debug)]
pub struct InitConfigArgs {
    /// Overwrite an existing configuration file
    #[arg(long)]
    pub force: bool,

    /// Add a target with this name
    #[arg(long, requires = "watch", requires = "repository")]
    pub target: Option<String>,

    /// Directory to watch (repeatable)
    #[arg(long)]
    pub watch: Vec<PathBuf>,

    /// Repository directory for the target
    #[arg(long)]
    pub repository: Option<PathBuf>,

    /// Use a git repository, pushing to this remote URL
    #[arg(long)]
    pub git_remote: Option<String>,
}

/// Run the init-config command
pub async fn run(args: InitConfigArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let path = global.config_path()?;
    if path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let mut config = Config::default();
    if let (Some(name), Some(repository)) = (args.target, args.repository) {
        let repository = match args.git_remote {
            Some(remote) => RepositoryConfig::Git {
                path: repository,
                remote: Some(remote),
                branch: "main".to_string(),
            },
            None => RepositoryConfig::Directory {
                path: repository,
                mirror: None,
            },
        };
        let mut target = TargetConfig::new(name, args.watch, repository);
        target.schedule = Some(ScheduleConfig::default());
        config.targets.push(target);
    }
    config.validate()?;
    config.save_to(&path)?;

    println!("Configuration written to {}", path.display());
    Ok(())
}
