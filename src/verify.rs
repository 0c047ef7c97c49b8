//! Integrity verification of recorded versions.
//!
//! A version passes when its artifact decodes, every shipped entry matches
//! its declared fingerprint, the header agrees with the recorded manifest,
//! and replaying the change set onto the parent reproduces the manifest's
//! file list. Nothing is written to disk.

use crate::manifest::{FileRecord, Manifest, VersionId};
use crate::packager::{self, BackupArtifact, Encryption, UnpackedArtifact};
use crate::pipeline::{with_timeout, TargetContext};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, span, warn, Instrument, Level};

/// Result of verifying one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub version_id: VersionId,
    pub passed: bool,
    /// Paths whose content does not match the recorded fingerprints
    pub mismatched: Vec<PathBuf>,
    /// Structural or lineage problems
    pub problems: Vec<String>,
}

/// A version that cannot be verified or restored because its lineage is broken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub version_id: VersionId,
    pub reason: String,
}

/// Result of verifying every version of a target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyAllReport {
    pub total: usize,
    pub passed: usize,
    pub failed: Vec<VerifyReport>,
    pub chain_breaks: Vec<ChainBreak>,
}

impl VerifyAllReport {
    pub fn is_healthy(&self) -> bool {
        self.failed.is_empty() && self.chain_breaks.is_empty()
    }
}

/// Outcome of checking one artifact against its manifest
#[derive(Debug)]
pub(crate) struct ArtifactCheck {
    pub unpacked: UnpackedArtifact,
    pub mismatched: Vec<PathBuf>,
    pub problems: Vec<String>,
}

impl ArtifactCheck {
    pub fn passed(&self) -> bool {
        self.mismatched.is_empty() && self.problems.is_empty()
    }

    /// Convert a failed check into the error restore reports
    pub fn into_result(self, version_id: &VersionId) -> Result<UnpackedArtifact> {
        if self.passed() {
            return Ok(self.unpacked);
        }
        let mut reason = format!("version {} failed verification", version_id);
        if !self.problems.is_empty() {
            reason.push_str(": ");
            reason.push_str(&self.problems.join("; "));
        }
        Err(Error::integrity(reason, self.mismatched))
    }
}

/// Check artifact bytes against the manifest recorded for them.
///
/// `parent_files` is the parent's full file list (empty for a chain root);
/// pass `None` when it is unavailable to skip the replay check.
pub(crate) fn check_artifact(
    manifest: &Manifest,
    parent_files: Option<&[FileRecord]>,
    bytes: &[u8],
    encryption: Option<&Encryption>,
) -> Result<ArtifactCheck> {
    let artifact = BackupArtifact::decode(bytes)?;
    let inspection = packager::inspect(&artifact, encryption)?;
    let header = &artifact.header.manifest;

    let mut problems = Vec::new();
    let mut mismatched = inspection.mismatched;

    if header.parent_version_id != manifest.parent_version_id {
        problems.push(format!(
            "artifact parent {:?} differs from recorded parent {:?}",
            header.parent_version_id, manifest.parent_version_id
        ));
    }
    if header.full_file_list != manifest.full_file_list {
        problems.push("artifact file list differs from the manifest".to_string());
    }
    if header.options != manifest.options {
        problems.push("artifact options differ from the manifest".to_string());
    }

    let change_set = &inspection.unpacked.change_set;
    for record in change_set.content_records() {
        match manifest.find_file(&record.path) {
            Some(recorded) if recorded.same_content(record) => {}
            _ => {
                if !mismatched.contains(&record.path) {
                    mismatched.push(record.path.clone());
                }
            }
        }
    }

    if let Some(parent_files) = parent_files {
        match change_set.apply(parent_files) {
            Ok(replayed) if replayed == manifest.full_file_list => {}
            Ok(_) => problems.push("replaying the change set does not reproduce the manifest".to_string()),
            Err(e) => problems.push(e.to_string()),
        }
    }

    mismatched.sort();
    Ok(ArtifactCheck {
        unpacked: inspection.unpacked,
        mismatched,
        problems,
    })
}

fn failed_report(version_id: &VersionId, error: &Error) -> VerifyReport {
    VerifyReport {
        version_id: version_id.clone(),
        passed: false,
        mismatched: error.paths(),
        problems: vec![error.to_string()],
    }
}

/// Verify one version of a target
pub async fn verify(target: &TargetContext, version_id: &VersionId) -> Result<VerifyReport> {
    let (manifest, parent_files) = {
        let manifests = target.manifests.lock();
        let manifest = match manifests.get(version_id) {
            Some(manifest) => manifest.clone(),
            None if manifests.contains(version_id) => {
                return Err(Error::ChainBroken {
                    version: version_id.to_string(),
                    reason: "manifest is missing".to_string(),
                })
            }
            None => {
                return Err(Error::VersionNotFound {
                    version: version_id.to_string(),
                })
            }
        };
        let parent_files = match &manifest.parent_version_id {
            None => Some(Vec::new()),
            Some(parent) => manifests.get(parent).map(|m| m.full_file_list.clone()),
        };
        (manifest, parent_files)
    };

    let settings = target.remote.settings();
    let bytes = with_timeout("fetch", settings.fetch_timeout, target.store.fetch(version_id))
        .await
        .map_err(|e| Error::ChainBroken {
            version: version_id.to_string(),
            reason: format!("artifact cannot be fetched: {}", e),
        })?;

    let report = match check_artifact(
        &manifest,
        parent_files.as_deref(),
        &bytes,
        target.encryption.as_ref(),
    ) {
        Ok(check) => VerifyReport {
            version_id: version_id.clone(),
            passed: check.passed(),
            mismatched: check.mismatched,
            problems: check.problems,
        },
        Err(e @ Error::Crypto { .. }) => return Err(e),
        Err(e) => failed_report(version_id, &e),
    };

    if report.passed {
        info!("Version {} verified", version_id);
    } else {
        warn!(
            "Version {} failed verification: {} mismatched, {:?}",
            version_id,
            report.mismatched.len(),
            report.problems
        );
    }
    Ok(report)
}

/// Verify every recorded version, collecting failures instead of stopping
pub async fn verify_all(target: &TargetContext) -> Result<VerifyAllReport> {
    let span = span!(Level::INFO, "verify_all", name = %target.name);
    verify_chain(target).instrument(span).await
}

async fn verify_chain(target: &TargetContext) -> Result<VerifyAllReport> {
    let (loaded, missing) = {
        let manifests = target.manifests.lock();
        let loaded: Vec<Manifest> = manifests.list().into_iter().cloned().collect();
        let missing: Vec<VersionId> = manifests.missing_versions().into_iter().cloned().collect();
        (loaded, missing)
    };

    let mut report = VerifyAllReport {
        total: loaded.len() + missing.len(),
        ..VerifyAllReport::default()
    };
    for version_id in missing {
        report.chain_breaks.push(ChainBreak {
            version_id,
            reason: "manifest is missing".to_string(),
        });
    }

    for manifest in &loaded {
        // Anything built on a missing ancestor cannot be restored
        let chain = target.manifests.lock().chain(&manifest.version_id).map(|_| ());
        if let Err(e) = chain {
            report.chain_breaks.push(ChainBreak {
                version_id: manifest.version_id.clone(),
                reason: e.to_string(),
            });
            continue;
        }

        match verify(target, &manifest.version_id).await {
            Ok(version_report) if version_report.passed => report.passed += 1,
            Ok(version_report) => report.failed.push(version_report),
            Err(Error::ChainBroken { reason, .. }) => report.chain_breaks.push(ChainBreak {
                version_id: manifest.version_id.clone(),
                reason,
            }),
            Err(e) => report.failed.push(failed_report(&manifest.version_id, &e)),
        }
    }

    info!(
        "Verified {}: {} passed, {} failed, {} chain breaks",
        target.name,
        report.passed,
        report.failed.len(),
        report.chain_breaks.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::BackupOptions;
    use crate::pipeline::remote::RemoteSettings;
    use crate::pipeline::{BackupPipeline, RunKind, StatusHandle};
    use crate::scanner::ScanOptions;
    use crate::storage::DirStore;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_corrupted_artifact_fails_verification() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let watched = temp_dir.path().join("docs");
        fs::create_dir_all(&watched)?;
        fs::write(watched.join("a.txt"), vec![b'a'; 64])?;

        let store_root = temp_dir.path().join("store");
        let target = Arc::new(TargetContext::open(
            "docs",
            vec![watched.clone()],
            BackupOptions::default(),
            ScanOptions::default(),
            Arc::new(DirStore::new(&store_root, None)),
            None,
            RemoteSettings::default(),
            temp_dir.path().join("state"),
        )?);

        let status = StatusHandle::new("docs", RunKind::Backup);
        BackupPipeline::new(target.clone()).run(&status).await?;
        fs::write(watched.join("b.txt"), b"second")?;
        BackupPipeline::new(target.clone()).run(&status).await?;

        let report = verify_all(&target).await?;
        assert_eq!(report.total, 2);
        assert_eq!(report.passed, 2);
        assert!(report.is_healthy());

        // Flip the last payload byte of the first version's artifact
        let v1 = target.manifests.lock().list()[0].version_id.clone();
        let object = store_root.join("objects").join(format!("{}.artifact", v1));
        let mut bytes = fs::read(&object)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0x20;
        fs::write(&object, bytes)?;

        let report = verify(&target, &v1).await?;
        assert!(!report.passed);
        assert_eq!(report.mismatched, vec![PathBuf::from("docs/a.txt")]);

        let report = verify_all(&target).await?;
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed.len(), 1);

        // Losing an artifact is a chain break, not a verification failure
        fs::remove_file(&object)?;
        let report = verify_all(&target).await?;
        assert_eq!(report.chain_breaks.len(), 1);
        assert_eq!(report.chain_breaks[0].version_id, v1);
        Ok(())
    }
}
