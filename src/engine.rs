//! The surface exposed to front-ends.
//!
//! An [`Engine`] owns one [`TargetContext`] per configured target and a
//! registry of runs. `run_backup_now` and `restore` start a run in the
//! background and return its [`RunId`]; `get_status` observes it. The
//! `*_blocking` variants await completion instead.

use crate::config::{Config, RepositoryConfig, TargetConfig};
use crate::crypto::cipher_for;
use crate::manifest::{ManifestSummary, VersionId};
use crate::packager::Encryption;
use crate::pipeline::remote::{PendingPush, RetryOutcome};
use crate::pipeline::{
    BackupPipeline, DestinationLocks, RestoreOptions, RestorePipeline, RestoreResult, RunKind,
    RunOutcome, RunStatus, StatusHandle, TargetContext,
};
use crate::scheduler::{anchor_at, BackupTrigger, ScheduleEntry, ScheduleState};
use crate::storage::{DirStore, GitStore, VersionStore};
use crate::verify::{self, VerifyAllReport, VerifyReport};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of a background run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backup engine over every configured target
pub struct Engine {
    config: Config,
    targets: HashMap<String, Arc<TargetContext>>,
    runs: Arc<RwLock<HashMap<RunId, StatusHandle>>>,
    locks: DestinationLocks,
}

impl Engine {
    /// Open every target in `config`, initializing repositories as needed
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let mut targets = HashMap::new();
        for target in &config.targets {
            let context = open_target(&config, target).await?;
            debug!("Opened target {:?}", context);
            targets.insert(target.name.clone(), Arc::new(context));
        }
        info!("Engine ready with {} targets", targets.len());

        Ok(Self {
            config,
            targets,
            runs: Arc::new(RwLock::new(HashMap::new())),
            locks: DestinationLocks::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Configured target names, sorted
    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn target(&self, name: &str) -> Result<Arc<TargetContext>> {
        self.targets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTarget {
                name: name.to_string(),
            })
    }

    fn register(&self, target: &str, kind: RunKind) -> (RunId, StatusHandle) {
        let run_id = RunId::new();
        let status = StatusHandle::new(target, kind);
        let mut runs = self.runs.write();
        evict_finished(&mut runs, MAX_TRACKED_RUNS - 1);
        runs.insert(run_id, status.clone());
        (run_id, status)
    }

    /// Start a backup of `target` in the background
    pub fn run_backup_now(&self, target: &str) -> Result<RunId> {
        let pipeline = BackupPipeline::new(self.target(target)?);
        let (run_id, status) = self.register(target, RunKind::Backup);
        info!("Starting backup run {} for {}", run_id, target);

        tokio::spawn(async move {
            // The outcome is recorded in the status handle
            let _ = pipeline.run(&status).await;
        });
        Ok(run_id)
    }

    /// Run a backup of `target` and wait for it
    pub async fn backup_blocking(&self, target: &str) -> Result<RunOutcome> {
        let pipeline = BackupPipeline::new(self.target(target)?);
        let status = StatusHandle::new(target, RunKind::Backup);
        pipeline.run(&status).await
    }

    /// Start restoring a version of `target` into `destination` in the background
    pub fn restore(
        &self,
        target: &str,
        version_id: &VersionId,
        destination: &Path,
        options: RestoreOptions,
    ) -> Result<RunId> {
        let pipeline = RestorePipeline::new(self.target(target)?, self.locks.clone());
        let (run_id, status) = self.register(target, RunKind::Restore);
        info!("Starting restore run {} of {} into {}", run_id, version_id, destination.display());

        let version_id = version_id.clone();
        let destination = destination.to_path_buf();
        tokio::spawn(async move {
            let _ = pipeline
                .run(&version_id, &destination, &options, &status)
                .await;
        });
        Ok(run_id)
    }

    /// Restore a version and wait for it
    pub async fn restore_blocking(
        &self,
        target: &str,
        version_id: &VersionId,
        destination: &Path,
        options: &RestoreOptions,
    ) -> Result<RestoreResult> {
        let pipeline = RestorePipeline::new(self.target(target)?, self.locks.clone());
        let status = StatusHandle::new(target, RunKind::Restore);
        pipeline.run(version_id, destination, options, &status).await
    }

    /// Current status of a run started by this engine
    pub fn get_status(&self, run_id: RunId) -> Option<RunStatus> {
        self.runs.read().get(&run_id).map(StatusHandle::snapshot)
    }

    /// Wait until a run finishes
    pub async fn wait(&self, run_id: RunId) -> Result<RunStatus> {
        loop {
            let status = self.get_status(run_id).ok_or(Error::Cancelled)?;
            if status.is_finished() {
                return Ok(status);
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    /// Recorded versions of `target`, oldest first
    pub fn list_versions(&self, target: &str) -> Result<Vec<ManifestSummary>> {
        let context = self.target(target)?;
        let with_sync = context.store.has_remote();
        let summaries = context
            .manifests
            .lock()
            .list()
            .into_iter()
            .map(|manifest| {
                let mut summary = manifest.summary();
                if with_sync {
                    summary.sync = Some(context.remote.state_of(&manifest.version_id));
                }
                summary
            })
            .collect();
        Ok(summaries)
    }

    pub async fn verify(&self, target: &str, version_id: &VersionId) -> Result<VerifyReport> {
        verify::verify(&*self.target(target)?, version_id).await
    }

    pub async fn verify_all(&self, target: &str) -> Result<VerifyAllReport> {
        verify::verify_all(&*self.target(target)?).await
    }

    /// Remove the newest version of `target` from its chain
    pub fn prune(&self, target: &str, version_id: &VersionId) -> Result<()> {
        let context = self.target(target)?;
        let busy = || Error::ConcurrentRun {
            target: target.to_string(),
        };
        if context.is_running() {
            return Err(busy());
        }
        let Some(_run_lock) = context.try_lock_run()? else {
            return Err(busy());
        };
        context.refresh()?;
        context.manifests.lock().prune(version_id)?;
        context.remote.forget(version_id)
    }

    pub fn pending_pushes(&self, target: &str) -> Result<Vec<PendingPush>> {
        Ok(self.target(target)?.remote.pending())
    }

    /// Retry the queued pushes of `target`
    pub async fn retry_pending(&self, target: &str, force: bool) -> Result<RetryOutcome> {
        let context = self.target(target)?;
        context.remote.retry_pending(&*context.store, force).await
    }

    fn schedule_path(&self, target: &str) -> PathBuf {
        self.config.target_state_dir(target).join("schedule.json")
    }

    /// Schedule of `target`; `persist` writes a fresh or re-anchored state to disk
    fn schedule_state(
        &self,
        target: &TargetConfig,
        now: DateTime<Utc>,
        persist: bool,
    ) -> Result<Option<ScheduleState>> {
        let (Some(frequency), Some(schedule)) = (target.frequency()?, target.schedule.as_ref()) else {
            return Ok(None);
        };
        let anchor = anchor_at(schedule.hour, schedule.minute, now)?;
        let path = self.schedule_path(&target.name);
        let state = if persist {
            ScheduleState::load_or_create(&path, &target.name, frequency, anchor, now)?
        } else {
            ScheduleState::peek(&path, &target.name, frequency, anchor, now)?
        };
        Ok(Some(state))
    }

    /// Persisted schedules of every scheduled target
    pub fn schedule_entries(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
        let mut entries = Vec::new();
        for target in &self.config.targets {
            if let Some(state) = self.schedule_state(target, now, true)? {
                entries.push(ScheduleEntry {
                    path: self.schedule_path(&target.name),
                    state,
                });
            }
        }
        Ok(entries)
    }

    /// When `target` next runs, if it is scheduled
    pub fn next_run(&self, target: &str) -> Result<Option<DateTime<Utc>>> {
        let config = self.config.target(target)?;
        Ok(self.schedule_state(config, Utc::now(), false)?.map(|s| s.next_run))
    }
}

#[async_trait]
impl BackupTrigger for Engine {
    async fn trigger(&self, target: &str) -> Result<()> {
        match self.backup_blocking(target).await? {
            RunOutcome::Recorded { summary, .. } => {
                info!("Scheduled backup of {} recorded {}", target, summary.version_id)
            }
            RunOutcome::NoChanges => info!("Scheduled backup of {}: no changes", target),
            RunOutcome::AlreadyRunning => info!("Scheduled backup of {} skipped: already running", target),
        }
        Ok(())
    }

    async fn idle(&self) -> Result<()> {
        for (name, context) in &self.targets {
            if !context.store.has_remote() || context.remote.next_due().is_none() {
                continue;
            }
            match context.remote.retry_pending(&*context.store, false).await {
                Ok(RetryOutcome::Failed { version_id, error, .. }) => {
                    warn!("Retry of {} for {} failed: {}", version_id, name, error)
                }
                Ok(_) => {}
                Err(e) => warn!("Retrying pushes for {} failed: {}", name, e),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("targets", &self.target_names())
            .field("runs", &self.runs.read().len())
            .finish()
    }
}

/// Background runs remembered for `get_status`; older finished ones are dropped
const MAX_TRACKED_RUNS: usize = 64;

/// Drop the longest-finished runs until at most `keep` remain. Runs still in
/// flight are never dropped.
fn evict_finished(runs: &mut HashMap<RunId, StatusHandle>, keep: usize) {
    if runs.len() <= keep {
        return;
    }
    let mut finished: Vec<(DateTime<Utc>, RunId)> = runs
        .iter()
        .filter_map(|(run_id, status)| status.snapshot().finished.map(|at| (at, *run_id)))
        .collect();
    finished.sort_by_key(|(at, _)| *at);
    let excess = runs.len() - keep;
    for (_, run_id) in finished.into_iter().take(excess) {
        runs.remove(&run_id);
    }
}

async fn open_store(repository: &RepositoryConfig) -> Result<Arc<dyn VersionStore>> {
    match repository {
        RepositoryConfig::Git {
            path,
            remote,
            branch,
        } => {
            let store = GitStore::new(path, remote.clone(), branch.clone());
            store.init().await?;
            Ok(Arc::new(store))
        }
        RepositoryConfig::Directory { path, mirror } => {
            Ok(Arc::new(DirStore::new(path, mirror.clone())))
        }
    }
}

async fn open_target(config: &Config, target: &TargetConfig) -> Result<TargetContext> {
    let store = open_store(&target.repository).await?;

    // Keep the key whenever one is configured: versions sealed before
    // encryption was switched off still have to be opened
    let encryption = match target.key() {
        Some(key) => match cipher_for(target.cipher) {
            Ok(cipher) => Some(Encryption { cipher, key }),
            Err(e) if !target.encryption => {
                warn!("Key for {} is unusable, encrypted versions cannot be read: {}", target.name, e);
                None
            }
            Err(e) => return Err(e),
        },
        None => None,
    };

    TargetContext::open(
        target.name.clone(),
        target.watched_paths.clone(),
        target.backup_options(),
        target.scan_options(),
        store,
        encryption,
        target.remote.settings(),
        config.target_state_dir(&target.name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::pipeline::{RunResult, Stage};
    use std::fs;
    use tempfile::TempDir;

    fn config_for(root: &Path) -> Config {
        let mut target = TargetConfig::new(
            "docs",
            vec![root.join("docs")],
            RepositoryConfig::Directory {
                path: root.join("store"),
                mirror: None,
            },
        );
        target.schedule = Some(ScheduleConfig::default());

        Config {
            state_dir: root.join("state"),
            targets: vec![target],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_background_backup_and_status() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("docs"))?;
        fs::write(temp_dir.path().join("docs").join("a.txt"), b"hello")?;

        let engine = Engine::open(config_for(temp_dir.path())).await?;
        let run_id = engine.run_backup_now("docs")?;
        let status = engine.wait(run_id).await?;

        assert_eq!(status.stage, Stage::Idle);
        assert!(status.error.is_none());
        assert!(matches!(
            status.outcome,
            Some(RunResult::Backup(RunOutcome::Recorded { .. }))
        ));

        let versions = engine.list_versions("docs")?;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].file_count, 1);
        assert_eq!(versions[0].sync, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_only_tail() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&docs)?;
        fs::write(docs.join("a.txt"), b"one")?;

        let engine = Engine::open(config_for(temp_dir.path())).await?;
        engine.backup_blocking("docs").await?;
        fs::write(docs.join("b.txt"), b"two")?;
        engine.backup_blocking("docs").await?;

        let versions = engine.list_versions("docs")?;
        assert!(matches!(
            engine.prune("docs", &versions[0].version_id),
            Err(Error::PruneRefused { .. })
        ));
        engine.prune("docs", &versions[1].version_id)?;
        assert_eq!(engine.list_versions("docs")?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_target_and_schedule() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("docs"))?;

        let engine = Engine::open(config_for(temp_dir.path())).await?;
        assert!(matches!(
            engine.run_backup_now("music"),
            Err(Error::UnknownTarget { .. })
        ));

        let schedule = engine.schedule_path("docs");
        let next = engine.next_run("docs")?.unwrap();
        assert!(next > Utc::now());
        assert!(!schedule.exists());

        assert_eq!(engine.schedule_entries(Utc::now())?.len(), 1);
        assert!(schedule.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_registry_stays_bounded() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("docs"))?;
        let engine = Engine::open(config_for(temp_dir.path())).await?;

        engine.backup_blocking("docs").await?;
        assert!(engine.runs.read().is_empty());

        let (in_flight, _) = engine.register("docs", RunKind::Backup);
        let mut last = in_flight;
        for _ in 0..MAX_TRACKED_RUNS * 2 {
            let (run_id, status) = engine.register("docs", RunKind::Backup);
            status.finish(RunResult::Backup(RunOutcome::NoChanges));
            last = run_id;
        }

        assert_eq!(engine.runs.read().len(), MAX_TRACKED_RUNS);
        assert!(engine.get_status(in_flight).is_some());
        assert!(engine.get_status(last).is_some());
        Ok(())
    }
}
