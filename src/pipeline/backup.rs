//! The backup pipeline: Reconcile → Scan → Diff → Pack → Commit → Push → Record

use super::{blocking, with_timeout, RunResult, Stage, StatusHandle, TargetContext};
use crate::changeset::{diff, ChangeSet};
use crate::manifest::{
    FileRecord, Manifest, ManifestHeader, ManifestStore, ManifestSummary, VersionId,
};
use crate::packager::{self, BackupArtifact};
use crate::pipeline::remote::SyncState;
use crate::scanner;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, span, warn, Instrument, Level};
use uuid::Uuid;

/// How a backup run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// A new version was committed and recorded
    Recorded {
        summary: ManifestSummary,
        sync: SyncState,
        scan_warnings: usize,
    },
    /// The tree matches the latest version
    NoChanges,
    /// Another run holds the target
    AlreadyRunning,
}

/// What reconciliation did with the store's latest version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Store and chain agree
    InSync,
    /// An unrecorded commit was validated and appended
    Adopted(VersionId),
    /// An unrecorded commit failed validation and was marked abandoned
    Abandoned(VersionId),
}

/// Stateless orchestrator over one target
#[derive(Debug, Clone)]
pub struct BackupPipeline {
    target: Arc<TargetContext>,
}

impl BackupPipeline {
    pub fn new(target: Arc<TargetContext>) -> Self {
        Self { target }
    }

    /// Run one backup, recording progress in `status`.
    ///
    /// A concurrent trigger for the same target returns
    /// [`RunOutcome::AlreadyRunning`] without touching anything.
    pub async fn run(&self, status: &StatusHandle) -> Result<RunOutcome> {
        let Ok(_gate) = self.target.gate().try_lock_owned() else {
            info!("Backup of {} already running", self.target.name);
            return Ok(already_running(status));
        };
        let _run_lock = match self.target.try_lock_run() {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!("Backup of {} already running in another process", self.target.name);
                return Ok(already_running(status));
            }
            Err(e) => {
                status.fail(&e);
                return Err(e);
            }
        };

        let span = span!(Level::INFO, "backup", name = %self.target.name);
        let result = self.run_locked(status).instrument(span).await;

        match &result {
            Ok(outcome) => status.finish(RunResult::Backup(outcome.clone())),
            Err(e) => {
                warn!("Backup of {} failed: {}", self.target.name, e);
                status.fail(e);
            }
        }
        result
    }

    async fn run_locked(&self, status: &StatusHandle) -> Result<RunOutcome> {
        let target = &self.target;
        let settings = *target.remote.settings();
        target.refresh()?;

        status.advance(Stage::Reconciling, 0.0);
        if target.store.has_remote() {
            if let Err(e) = with_timeout("pull", settings.pull_timeout, target.store.pull()).await {
                warn!("Pull failed, continuing with local state: {}", e);
            }
        }
        match reconcile(target).await? {
            Reconciliation::InSync => {}
            Reconciliation::Adopted(id) => info!("Adopted orphaned version {}", id),
            Reconciliation::Abandoned(id) => warn!("Abandoned orphaned version {}", id),
        }

        // Scan
        status.advance(Stage::Scanning, 0.1);
        let (latest_id, previous) = {
            let manifests = target.manifests.lock();
            (
                manifests.latest_version_id().cloned(),
                manifests.latest().cloned(),
            )
        };
        if latest_id.is_some() && previous.is_none() {
            warn!(
                "Manifest of latest version {} is missing; starting a new chain",
                latest_id.as_ref().map(|id| id.as_str()).unwrap_or_default()
            );
        }
        let previous_files: Vec<FileRecord> = previous
            .as_ref()
            .map(|m| m.full_file_list.clone())
            .unwrap_or_default();

        let roots = target.roots()?;
        let scan_options = target.scan.clone();
        let prefilter = previous_files.clone();
        let snapshot =
            blocking(move || scanner::scan(&roots, &scan_options, &prefilter)).await?;
        let scan_warnings = snapshot.warnings.len();

        // Diff
        status.advance(Stage::Diffing, 0.4);
        let change_set = diff(&previous_files, &snapshot.records);
        if change_set.is_empty() {
            info!("No changes since {}", latest_id.as_ref().map(|id| id.as_str()).unwrap_or("start"));
            return Ok(RunOutcome::NoChanges);
        }

        let (change_set, parent) = match previous {
            Some(previous) if target.options.incremental => (change_set, Some(previous.version_id)),
            Some(_) => {
                debug!("Incremental mode off; recording a full version");
                (ChangeSet::full(&snapshot.records), None)
            }
            None => (change_set, None),
        };
        let counts = change_set.counts();
        info!(
            "Changes: {} added, {} modified, {} deleted",
            counts.added, counts.modified, counts.deleted
        );

        // Pack
        status.advance(Stage::Packaging, 0.5);
        let header = ManifestHeader {
            parent_version_id: parent,
            created: Utc::now(),
            full_file_list: snapshot.records.clone(),
            options: target.options,
            changes: counts,
        };
        let staging = target.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;
        let artifact_path = staging.join(format!("{}.artifact", Uuid::new_v4()));
        let header = {
            let encryption = target.encryption.clone();
            let artifact_path = artifact_path.clone();
            blocking(move || {
                let artifact =
                    packager::pack(&change_set, header, &snapshot, encryption.as_ref())?;
                if artifact.header.entries.is_empty() {
                    return Ok(None);
                }
                artifact.write_to(&artifact_path)?;
                Ok(Some(artifact.header.manifest))
            })
            .await?
        };
        let Some(header) = header else {
            info!("Every changed file became unreadable before packing; nothing to record");
            return Ok(RunOutcome::NoChanges);
        };
        let counts = header.changes;

        // Commit
        status.advance(Stage::Committing, 0.7);
        let message = format!(
            "AutoStash backup {} (+{} ~{} -{})",
            header.created.format("%Y-%m-%d %H:%M:%S UTC"),
            counts.added,
            counts.modified,
            counts.deleted
        );
        let committed = with_timeout(
            "commit",
            settings.commit_timeout,
            target.store.commit(&artifact_path, &message),
        )
        .await;
        if let Err(e) = tokio::fs::remove_file(&artifact_path).await {
            debug!("Could not remove staged artifact: {}", e);
        }
        let version_id = committed?;

        replicate(target, &version_id).await?;

        // Record
        status.advance(Stage::Recording, 0.9);
        let manifest = Manifest::from_header(version_id.clone(), header);
        let summary = manifest.summary();
        target.manifests.lock().append(manifest)?;

        Ok(RunOutcome::Recorded {
            sync: target.remote.state_of(&version_id),
            summary,
            scan_warnings,
        })
    }
}

fn already_running(status: &StatusHandle) -> RunOutcome {
    let outcome = RunOutcome::AlreadyRunning;
    status.finish(RunResult::Backup(outcome.clone()));
    outcome
}

/// Make sure the store's latest version is either recorded or abandoned.
///
/// A commit that landed without its manifest being appended (a crash between
/// commit and record) is adopted when it extends the current chain and its
/// artifact replays to the file list it declares.
pub async fn reconcile(target: &TargetContext) -> Result<Reconciliation> {
    let settings = *target.remote.settings();
    let Some(candidate) =
        with_timeout("latest", settings.fetch_timeout, target.store.latest()).await?
    else {
        return Ok(Reconciliation::InSync);
    };

    {
        let manifests = target.manifests.lock();
        if manifests.contains(&candidate) || manifests.is_abandoned(&candidate) {
            return Ok(Reconciliation::InSync);
        }
    }

    info!("Store holds unrecorded version {}; reconciling", candidate);
    let bytes = match with_timeout("fetch", settings.fetch_timeout, target.store.fetch(&candidate)).await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            target
                .manifests
                .lock()
                .mark_abandoned(&candidate, format!("artifact unreadable: {}", e))?;
            return Ok(Reconciliation::Abandoned(candidate));
        }
    };

    let adopted = {
        let mut manifests = target.manifests.lock();
        match validate_orphan(&manifests, &bytes, target) {
            Ok(header) => {
                manifests.append(Manifest::from_header(candidate.clone(), header))?;
                true
            }
            Err(reason) => {
                manifests.mark_abandoned(&candidate, reason)?;
                false
            }
        }
    };
    if !adopted {
        return Ok(Reconciliation::Abandoned(candidate));
    }

    // The crashed run may never have reached its push
    replicate(target, &candidate).await?;
    Ok(Reconciliation::Adopted(candidate))
}

/// Push a committed version, queueing it for retry when the push fails
async fn replicate(target: &TargetContext, version_id: &VersionId) -> Result<()> {
    if !target.store.has_remote() {
        return Ok(());
    }
    let settings = target.remote.settings();
    match with_timeout("push", settings.push_timeout, target.store.push(version_id)).await {
        Ok(()) => {
            target.remote.mark_pushed(version_id)?;
        }
        Err(e) => target.remote.enqueue(version_id, &e)?,
    }
    Ok(())
}

fn validate_orphan(
    manifests: &ManifestStore,
    bytes: &[u8],
    target: &TargetContext,
) -> std::result::Result<ManifestHeader, String> {
    let artifact = BackupArtifact::decode(bytes).map_err(|e| e.to_string())?;
    let header = &artifact.header.manifest;

    let latest = manifests.latest_version_id();
    if let Some(parent) = &header.parent_version_id {
        if Some(parent) != latest {
            return Err(format!(
                "parent {} is not the latest recorded version",
                parent
            ));
        }
    }

    let unpacked =
        packager::unpack(&artifact, target.encryption.as_ref()).map_err(|e| e.to_string())?;
    let parent_files = match &header.parent_version_id {
        Some(parent) => manifests
            .get(parent)
            .map(|m| m.full_file_list.as_slice())
            .ok_or_else(|| format!("parent {} manifest is missing", parent))?,
        None => &[],
    };
    let replayed = unpacked
        .change_set
        .apply(parent_files)
        .map_err(|e| e.to_string())?;
    if replayed != header.full_file_list {
        return Err("replaying the change set does not reproduce its file list".to_string());
    }
    Ok(artifact.header.manifest)
}
