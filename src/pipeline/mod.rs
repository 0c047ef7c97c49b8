//! Backup and restore pipelines and the state they share.
//!
//! A run moves through an explicit [`Stage`] sequence recorded in a
//! [`StatusHandle`]; any stage may end in `Failed(kind)`. Each target owns a
//! [`TargetContext`] holding its manifest chain, version store and push queue.

pub mod backup;
pub mod remote;
pub mod restore;

pub use backup::{BackupPipeline, RunOutcome};
pub use remote::{BackoffStrategy, RemoteSettings, RemoteSync, RetryOutcome, SyncState};
pub use restore::{ConflictPolicy, DestinationLocks, RestoreOptions, RestorePipeline, RestoreResult};

use crate::error::ErrorKind;
use crate::manifest::{BackupOptions, ManifestStore};
use crate::packager::Encryption;
use crate::scanner::{roots_for, ScanOptions, WatchedRoot};
use crate::storage::VersionStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use fs4::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Everything the pipelines need to know about one backup target
pub struct TargetContext {
    pub name: String,
    pub watched_paths: Vec<PathBuf>,
    pub options: BackupOptions,
    pub scan: ScanOptions,
    pub store: Arc<dyn VersionStore>,
    pub manifests: Mutex<ManifestStore>,
    pub remote: RemoteSync,
    pub encryption: Option<Encryption>,
    /// Per-target state directory (manifests, queue, staging)
    pub state_dir: PathBuf,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl TargetContext {
    /// Open the manifest chain and push queue under `state_dir`
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        name: impl Into<String>,
        watched_paths: Vec<PathBuf>,
        options: BackupOptions,
        scan: ScanOptions,
        store: Arc<dyn VersionStore>,
        encryption: Option<Encryption>,
        remote: RemoteSettings,
        state_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        if options.encryption && encryption.is_none() {
            return Err(Error::Configuration {
                reason: "encryption is enabled but no key reference is configured".to_string(),
            });
        }
        Ok(Self {
            name: name.into(),
            watched_paths,
            options,
            scan,
            store,
            manifests: Mutex::new(ManifestStore::open(&state_dir)?),
            remote: RemoteSync::open(state_dir.join("push_queue.json"), remote)?,
            encryption,
            state_dir,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Roots derived from the watched paths and options
    pub fn roots(&self) -> Result<Vec<WatchedRoot>> {
        roots_for(&self.watched_paths, self.options.include_system_paths)
    }

    /// Whether a backup run currently holds this target
    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    pub(crate) fn gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.gate.clone()
    }

    /// Take the run lock shared by every process using this state directory.
    ///
    /// Returns `None` when another process (or another engine in this one)
    /// already holds it. The lock is released when the [`RunLock`] drops.
    pub fn try_lock_run(&self) -> Result<Option<RunLock>> {
        fs::create_dir_all(&self.state_dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.state_dir.join(RUN_LOCK_FILE))?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Some(RunLock { _file: file }))
    }

    /// Re-read the manifest chain and push queue, which another process may
    /// have advanced since this context was opened
    pub(crate) fn refresh(&self) -> Result<()> {
        let reopened = ManifestStore::open(&self.state_dir)?;
        *self.manifests.lock() = reopened;
        self.remote.reload()
    }

    pub(crate) fn staging_dir(&self) -> PathBuf {
        self.state_dir.join("staging")
    }
}

/// Lock file guarding backup runs of one target
const RUN_LOCK_FILE: &str = "run.lock";

/// Held for the duration of a run; dropping it releases the lock
#[derive(Debug)]
pub struct RunLock {
    _file: File,
}

impl std::fmt::Debug for TargetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetContext")
            .field("name", &self.name)
            .field("watched_paths", &self.watched_paths)
            .field("options", &self.options)
            .field("store", &self.store.describe())
            .finish()
    }
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "kind", rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Reconciling,
    Scanning,
    Diffing,
    Packaging,
    Committing,
    Recording,
    Resolving,
    Fetching,
    Verifying,
    Materializing,
    Failed(ErrorKind),
}

impl Stage {
    /// Whether the state machine may move from `self` to `next`
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (Failed(_), _) => false,
            (_, Failed(_)) | (_, Idle) => true,
            (Idle, Reconciling | Scanning | Resolving) => true,
            (Reconciling, Scanning) => true,
            (Scanning, Diffing) => true,
            (Diffing, Packaging) => true,
            (Packaging, Committing) => true,
            (Committing, Recording) => true,
            (Resolving, Fetching) => true,
            (Fetching, Verifying) => true,
            (Verifying, Materializing) => true,
            _ => false,
        }
    }
}

/// Kind of run tracked by a status handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Backup,
    Restore,
}

/// Error details surfaced in a run's status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    pub paths: Vec<PathBuf>,
}

impl From<&Error> for RunError {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            paths: error.paths(),
        }
    }
}

/// Final result of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "run", rename_all = "snake_case")]
pub enum RunResult {
    Backup(RunOutcome),
    Restore(RestoreResult),
}

/// Observable state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub target: String,
    pub kind: RunKind,
    pub stage: Stage,
    /// 0.0 to 1.0
    pub progress: f32,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub error: Option<RunError>,
    pub outcome: Option<RunResult>,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }
}

/// Shared, cheaply clonable view of a run's status
#[derive(Debug, Clone)]
pub struct StatusHandle(Arc<RwLock<RunStatus>>);

impl StatusHandle {
    pub fn new(target: impl Into<String>, kind: RunKind) -> Self {
        Self(Arc::new(RwLock::new(RunStatus {
            target: target.into(),
            kind,
            stage: Stage::Idle,
            progress: 0.0,
            started: Utc::now(),
            finished: None,
            error: None,
            outcome: None,
        })))
    }

    /// Copy of the current status
    pub fn snapshot(&self) -> RunStatus {
        self.0.read().clone()
    }

    pub fn stage(&self) -> Stage {
        self.0.read().stage
    }

    /// Move to `stage`, reporting `progress`
    pub fn advance(&self, stage: Stage, progress: f32) {
        let mut status = self.0.write();
        if !status.stage.can_advance_to(stage) {
            warn!("Unexpected stage transition {:?} -> {:?}", status.stage, stage);
        }
        status.stage = stage;
        status.progress = progress.clamp(0.0, 1.0);
    }

    /// Update progress within the current stage
    pub fn set_progress(&self, progress: f32) {
        self.0.write().progress = progress.clamp(0.0, 1.0);
    }

    /// Record the outcome and return to idle
    pub fn finish(&self, outcome: RunResult) {
        let mut status = self.0.write();
        status.stage = Stage::Idle;
        status.progress = 1.0;
        status.finished = Some(Utc::now());
        status.outcome = Some(outcome);
    }

    /// Record a failure
    pub fn fail(&self, error: &Error) {
        let mut status = self.0.write();
        status.stage = Stage::Failed(error.kind());
        status.finished = Some(Utc::now());
        status.error = Some(RunError::from(error));
    }
}

/// Run a store operation under a deadline
pub(crate) async fn with_timeout<T, F>(operation: &str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}

/// Run blocking work (hashing, packing, file writes) off the async runtime
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_transitions() {
        assert!(Stage::Idle.can_advance_to(Stage::Reconciling));
        assert!(Stage::Scanning.can_advance_to(Stage::Diffing));
        assert!(Stage::Committing.can_advance_to(Stage::Failed(ErrorKind::Timeout)));
        assert!(Stage::Recording.can_advance_to(Stage::Idle));
        assert!(!Stage::Scanning.can_advance_to(Stage::Committing));
        assert!(!Stage::Failed(ErrorKind::Io).can_advance_to(Stage::Scanning));
    }

    #[test]
    fn test_status_handle_records_failure() {
        let handle = StatusHandle::new("docs", RunKind::Backup);
        handle.advance(Stage::Scanning, 0.1);
        handle.fail(&Error::integrity("bad", vec![PathBuf::from("docs/a.txt")]));

        let status = handle.snapshot();
        assert_eq!(status.stage, Stage::Failed(ErrorKind::Integrity));
        let error = status.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Integrity);
        assert_eq!(error.paths, vec![PathBuf::from("docs/a.txt")]);
        assert!(status.finished.is_some());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let result: Result<()> = with_timeout("push", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }
}
