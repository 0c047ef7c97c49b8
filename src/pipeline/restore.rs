//! The restore pipeline: Resolve chain → Fetch → Verify → Materialize.
//!
//! Every artifact in the chain is fetched and verified, and the replayed
//! file list is checked against the target manifest, before a single byte
//! is written. Files are written through a temporary sibling and renamed
//! into place.

use super::{blocking, with_timeout, RunResult, Stage, StatusHandle, TargetContext};
use crate::manifest::{is_safe_relative, FileRecord, Manifest, VersionId};
use crate::verify::check_artifact;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, span, warn, Instrument, Level};

/// What to do when a restored file already exists at the destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Overwrite,
    Skip,
    /// Write the restored file next to the existing one under a new name
    Rename,
}

/// Options for a restore run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Permit restoring into (or inside) a watched directory
    pub allow_in_place: bool,
    pub conflict_policy: ConflictPolicy,
    /// Plan and verify without writing anything
    pub dry_run: bool,
}

/// Result of a restore run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub version_id: Option<VersionId>,
    pub destination: PathBuf,
    /// Relative paths written (or that would be written in a dry run)
    pub restored: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    /// (relative path, name actually written) for renamed conflicts
    pub renamed: Vec<(PathBuf, PathBuf)>,
    pub bytes_written: u64,
    pub dry_run: bool,
}

/// Serializes restores that target the same destination
#[derive(Debug, Clone, Default)]
pub struct DestinationLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of a destination
    pub async fn acquire(&self, destination: &Path) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .entry(destination.to_path_buf())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

/// Restores versions of one target
#[derive(Debug, Clone)]
pub struct RestorePipeline {
    target: Arc<TargetContext>,
    locks: DestinationLocks,
}

impl RestorePipeline {
    pub fn new(target: Arc<TargetContext>, locks: DestinationLocks) -> Self {
        Self { target, locks }
    }

    /// Restore `version_id` under `destination`
    pub async fn run(
        &self,
        version_id: &VersionId,
        destination: &Path,
        options: &RestoreOptions,
        status: &StatusHandle,
    ) -> Result<RestoreResult> {
        let span = span!(Level::INFO, "restore", name = %self.target.name, version = %version_id);
        let result = self
            .run_inner(version_id, destination, options, status)
            .instrument(span)
            .await;

        match &result {
            Ok(restored) => status.finish(RunResult::Restore(restored.clone())),
            Err(e) => {
                warn!("Restore of {} failed: {}", version_id, e);
                status.fail(e);
            }
        }
        result
    }

    async fn run_inner(
        &self,
        version_id: &VersionId,
        destination: &Path,
        options: &RestoreOptions,
        status: &StatusHandle,
    ) -> Result<RestoreResult> {
        let target = &self.target;
        let destination = normalize(destination)?;
        if !options.allow_in_place {
            check_not_in_place(&destination, &target.watched_paths)?;
        }
        let _guard = self.locks.acquire(&destination).await;

        // Resolve
        status.advance(Stage::Resolving, 0.0);
        let chain: Vec<Manifest> = target
            .manifests
            .lock()
            .chain(version_id)?
            .into_iter()
            .cloned()
            .collect();
        info!("Restoring {} from a chain of {} versions", version_id, chain.len());

        // Fetch
        status.advance(Stage::Fetching, 0.1);
        let settings = *target.remote.settings();
        let mut fetched = Vec::with_capacity(chain.len());
        for (i, manifest) in chain.iter().enumerate() {
            let bytes = with_timeout(
                "fetch",
                settings.fetch_timeout,
                target.store.fetch(&manifest.version_id),
            )
            .await
            .map_err(|e| Error::ChainBroken {
                version: manifest.version_id.to_string(),
                reason: format!("artifact cannot be fetched: {}", e),
            })?;
            fetched.push(bytes);
            status.set_progress(0.1 + 0.3 * (i + 1) as f32 / chain.len() as f32);
        }

        // Verify and replay
        status.advance(Stage::Verifying, 0.4);
        let encryption = target.encryption.clone();
        let target_manifest = chain
            .last()
            .cloned()
            .ok_or_else(|| Error::VersionNotFound {
                version: version_id.to_string(),
            })?;
        let contents = blocking(move || replay_chain(&chain, &fetched, encryption.as_ref())).await?;

        // Materialize
        status.advance(Stage::Materializing, 0.7);
        let plan = plan_writes(&destination, &target_manifest.full_file_list, options)?;
        let dry_run = options.dry_run;
        let files = target_manifest.full_file_list.clone();
        let write_destination = destination.clone();
        let bytes_written = if dry_run {
            0
        } else {
            blocking(move || write_files(&write_destination, &files, &plan.writes, contents)).await?
        };

        let result = RestoreResult {
            version_id: Some(version_id.clone()),
            destination,
            restored: plan.restored,
            skipped: plan.skipped,
            renamed: plan.renamed,
            bytes_written,
            dry_run,
        };
        info!(
            "Restored {} files ({} skipped, {} renamed){}",
            result.restored.len(),
            result.skipped.len(),
            result.renamed.len(),
            if dry_run { " [dry run]" } else { "" }
        );
        Ok(result)
    }
}

/// Verify every artifact of the chain and collect the content of the target's files
fn replay_chain(
    chain: &[Manifest],
    fetched: &[Vec<u8>],
    encryption: Option<&crate::packager::Encryption>,
) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut tree: Vec<FileRecord> = Vec::new();
    let mut contents: BTreeMap<PathBuf, Vec<u8>> = BTreeMap::new();

    for (manifest, bytes) in chain.iter().zip(fetched) {
        let check = check_artifact(manifest, Some(tree.as_slice()), bytes, encryption)?;
        let unpacked = check.into_result(&manifest.version_id)?;

        tree = unpacked.change_set.apply(&tree)?;
        if tree != manifest.full_file_list {
            return Err(Error::integrity(
                format!("replay diverges from manifest of {}", manifest.version_id),
                Vec::new(),
            ));
        }

        for path in &unpacked.change_set.deleted {
            contents.remove(path);
        }
        contents.extend(unpacked.contents);
        debug!("Replayed {}", manifest.version_id);
    }

    let missing: Vec<PathBuf> = tree
        .iter()
        .filter(|r| !contents.contains_key(&r.path))
        .map(|r| r.path.clone())
        .collect();
    if !missing.is_empty() {
        return Err(Error::integrity("chain does not carry content for every file", missing));
    }
    Ok(contents)
}

struct WritePlan {
    /// (relative path, absolute file to write)
    writes: Vec<(PathBuf, PathBuf)>,
    restored: Vec<PathBuf>,
    skipped: Vec<PathBuf>,
    renamed: Vec<(PathBuf, PathBuf)>,
}

fn plan_writes(destination: &Path, files: &[FileRecord], options: &RestoreOptions) -> Result<WritePlan> {
    let mut plan = WritePlan {
        writes: Vec::new(),
        restored: Vec::new(),
        skipped: Vec::new(),
        renamed: Vec::new(),
    };

    for record in files {
        if !is_safe_relative(&record.path) {
            return Err(Error::integrity("unsafe path in manifest", vec![record.path.clone()]));
        }
        let path = destination.join(&record.path);
        if path.exists() {
            match options.conflict_policy {
                ConflictPolicy::Overwrite => {}
                ConflictPolicy::Skip => {
                    plan.skipped.push(record.path.clone());
                    continue;
                }
                ConflictPolicy::Rename => {
                    let renamed = free_name(&path);
                    plan.renamed.push((record.path.clone(), renamed.clone()));
                    plan.restored.push(record.path.clone());
                    plan.writes.push((record.path.clone(), renamed));
                    continue;
                }
            }
        }
        plan.restored.push(record.path.clone());
        plan.writes.push((record.path.clone(), path));
    }
    Ok(plan)
}

/// First unused `<name>.restored[.N]` sibling of `path`
fn free_name(path: &Path) -> PathBuf {
    let base = format!("{}.restored", path.display());
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}.{}", base, n));
        n += 1;
    }
    candidate
}

fn write_files(
    destination: &Path,
    files: &[FileRecord],
    writes: &[(PathBuf, PathBuf)],
    mut contents: BTreeMap<PathBuf, Vec<u8>>,
) -> Result<u64> {
    let records: HashMap<&Path, &FileRecord> = files.iter().map(|r| (r.path.as_path(), r)).collect();
    fs::create_dir_all(destination)?;

    let mut written = 0u64;
    for (relative, path) in writes {
        let bytes = contents.remove(relative).ok_or_else(|| {
            Error::integrity("no content for file", vec![relative.clone()])
        })?;
        let modified = records.get(relative.as_path()).map(|r| SystemTime::from(r.modified));
        write_atomic(path, &bytes, modified)?;
        written += bytes.len() as u64;
    }
    Ok(written)
}

fn write_atomic(path: &Path, bytes: &[u8], modified: Option<SystemTime>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.autostash-tmp", file_name));
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        if let Some(modified) = modified {
            file.set_modified(modified)?;
        }
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Absolute, symlink-resolved form of a path that may not exist yet
fn normalize(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return Ok(rest.iter().rev().fold(canonical, |acc, part| acc.join(part)));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(absolute),
        }
    }
}

/// Refuse destinations that would write into a watched directory
fn check_not_in_place(destination: &Path, watched: &[PathBuf]) -> Result<()> {
    for root in watched {
        let root = normalize(root)?;
        let Some(name) = root.file_name() else {
            continue;
        };
        if destination.starts_with(&root) || destination.join(name).starts_with(&root) {
            return Err(Error::Configuration {
                reason: format!(
                    "Restoring to {} would overwrite watched directory {}; allow in-place restore to proceed",
                    destination.display(),
                    root.display()
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::BackupOptions;
    use crate::pipeline::remote::RemoteSettings;
    use crate::pipeline::{BackupPipeline, RunKind};
    use crate::scanner::ScanOptions;
    use crate::storage::DirStore;
    use tempfile::TempDir;

    fn context(root: &Path) -> Result<Arc<TargetContext>> {
        let watched = root.join("docs");
        fs::create_dir_all(&watched)?;
        Ok(Arc::new(TargetContext::open(
            "docs",
            vec![watched],
            BackupOptions::default(),
            ScanOptions::default(),
            Arc::new(DirStore::new(root.join("store"), None)),
            None,
            RemoteSettings::default(),
            root.join("state"),
        )?))
    }

    async fn backup(target: &Arc<TargetContext>) -> Result<VersionId> {
        let status = StatusHandle::new("docs", RunKind::Backup);
        BackupPipeline::new(target.clone()).run(&status).await?;
        target
            .manifests
            .lock()
            .latest_version_id()
            .cloned()
            .ok_or_else(|| Error::VersionNotFound {
                version: "latest".to_string(),
            })
    }

    async fn restore(
        target: &Arc<TargetContext>,
        version_id: &VersionId,
        destination: &Path,
        options: RestoreOptions,
    ) -> Result<RestoreResult> {
        let status = StatusHandle::new("docs", RunKind::Restore);
        RestorePipeline::new(target.clone(), DestinationLocks::new())
            .run(version_id, destination, &options, &status)
            .await
    }

    #[tokio::test]
    async fn test_in_place_restore_requires_opt_in() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let target = context(temp_dir.path())?;
        fs::write(temp_dir.path().join("docs/a.txt"), b"a")?;
        let v1 = backup(&target).await?;

        let inside = temp_dir.path().join("docs").join("restore");
        let result = restore(&target, &v1, &inside, RestoreOptions::default()).await;
        assert!(matches!(result, Err(Error::Configuration { .. })));

        // The parent of a watched directory would write straight into it
        let result = restore(&target, &v1, temp_dir.path(), RestoreOptions::default()).await;
        assert!(matches!(result, Err(Error::Configuration { .. })));

        let options = RestoreOptions {
            allow_in_place: true,
            ..RestoreOptions::default()
        };
        let result = restore(&target, &v1, temp_dir.path(), options).await?;
        assert_eq!(result.restored, vec![PathBuf::from("docs/a.txt")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_conflict_policies_and_dry_run() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let target = context(temp_dir.path())?;
        fs::write(temp_dir.path().join("docs/a.txt"), b"from backup")?;
        let v1 = backup(&target).await?;

        let out = temp_dir.path().join("out");
        fs::create_dir_all(out.join("docs"))?;
        fs::write(out.join("docs/a.txt"), b"local edit")?;

        let dry = RestoreOptions {
            dry_run: true,
            ..RestoreOptions::default()
        };
        let result = restore(&target, &v1, &out, dry).await?;
        assert!(result.dry_run);
        assert_eq!(result.bytes_written, 0);
        assert_eq!(fs::read(out.join("docs/a.txt"))?, b"local edit");

        let skip = RestoreOptions {
            conflict_policy: ConflictPolicy::Skip,
            ..RestoreOptions::default()
        };
        let result = restore(&target, &v1, &out, skip).await?;
        assert_eq!(result.skipped, vec![PathBuf::from("docs/a.txt")]);
        assert_eq!(fs::read(out.join("docs/a.txt"))?, b"local edit");

        let rename = RestoreOptions {
            conflict_policy: ConflictPolicy::Rename,
            ..RestoreOptions::default()
        };
        let result = restore(&target, &v1, &out, rename).await?;
        assert_eq!(result.renamed.len(), 1);
        assert_eq!(fs::read(out.join("docs/a.txt"))?, b"local edit");
        assert_eq!(fs::read(out.join("docs/a.txt.restored"))?, b"from backup");

        let result = restore(&target, &v1, &out, RestoreOptions::default()).await?;
        assert_eq!(result.bytes_written, 11);
        assert_eq!(fs::read(out.join("docs/a.txt"))?, b"from backup");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_artifact_is_chain_broken() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let target = context(temp_dir.path())?;
        fs::write(temp_dir.path().join("docs/a.txt"), b"one")?;
        let v1 = backup(&target).await?;
        fs::write(temp_dir.path().join("docs/b.txt"), b"two")?;
        let v2 = backup(&target).await?;

        fs::remove_file(
            temp_dir
                .path()
                .join("store/objects")
                .join(format!("{}.artifact", v1)),
        )?;
        let out = temp_dir.path().join("out");
        let result = restore(&target, &v2, &out, RestoreOptions::default()).await;
        assert!(matches!(result, Err(Error::ChainBroken { .. })));
        assert!(!out.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_destination_locks_serialize() -> Result<()> {
        let locks = DestinationLocks::new();
        let path = PathBuf::from("/tmp/autostash-lock-test");
        let guard = locks.acquire(&path).await;

        let second = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = second.acquire(Path::new("/tmp/autostash-lock-test")).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }
}
