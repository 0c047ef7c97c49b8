//! Manifest management: the append-only chain of backup versions

use crate::fingerprint::Fingerprint;
use crate::pipeline::remote::SyncState;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Opaque version identifier assigned by the version store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    /// Validate and wrap a version identifier
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 128
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::InvalidManifest {
                reason: format!("Invalid version id: {:?}", id),
            });
        }
        Ok(Self(id))
    }

    /// Get the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VersionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<VersionId> for String {
    fn from(id: VersionId) -> Self {
        id.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file record in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative, normalized path; the first component names the watched root
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// File modification time
    pub modified: DateTime<Utc>,
    /// BLAKE3 fingerprint of the file content
    pub fingerprint: Fingerprint,
}

impl FileRecord {
    /// Whether two records describe the same content
    pub fn same_content(&self, other: &FileRecord) -> bool {
        self.size == other.size && self.fingerprint == other.fingerprint
    }
}

/// Check that a path is relative and contains only normal components
pub fn is_safe_relative(path: &Path) -> bool {
    let mut components = path.components().peekable();
    if components.peek().is_none() {
        return false;
    }
    components.all(|c| matches!(c, Component::Normal(_)))
}

/// Options active when a version was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOptions {
    pub compression: bool,
    pub encryption: bool,
    pub incremental: bool,
    pub include_system_paths: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            compression: false,
            encryption: false,
            incremental: true,
            include_system_paths: false,
        }
    }
}

/// Number of entries of each kind in a version's change set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

/// Manifest fields known before the version store assigns an id.
///
/// This is what an artifact carries in its header, so a committed artifact
/// can be turned back into a manifest during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub parent_version_id: Option<VersionId>,
    pub created: DateTime<Utc>,
    pub full_file_list: Vec<FileRecord>,
    pub options: BackupOptions,
    pub changes: ChangeCounts,
}

/// The recorded full-tree state and lineage pointer for one backup version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest format version
    pub format: u32,
    pub version_id: VersionId,
    /// `None` only for a full backup that starts a chain
    pub parent_version_id: Option<VersionId>,
    pub created: DateTime<Utc>,
    /// Complete tree state after this version, sorted by path
    pub full_file_list: Vec<FileRecord>,
    pub options: BackupOptions,
    pub changes: ChangeCounts,
}

impl Manifest {
    /// Build a manifest from an artifact header and the id the store assigned
    pub fn from_header(version_id: VersionId, header: ManifestHeader) -> Self {
        Self {
            format: MANIFEST_VERSION,
            version_id,
            parent_version_id: header.parent_version_id,
            created: header.created,
            full_file_list: header.full_file_list,
            options: header.options,
            changes: header.changes,
        }
    }

    /// Find a file record by path
    pub fn find_file<P: AsRef<Path>>(&self, path: P) -> Option<&FileRecord> {
        let path = path.as_ref();
        self.full_file_list
            .binary_search_by(|r| r.path.as_path().cmp(path))
            .ok()
            .map(|idx| &self.full_file_list[idx])
    }

    /// Total bytes across the full file list
    pub fn total_size(&self) -> u64 {
        self.full_file_list.iter().map(|r| r.size).sum()
    }

    /// Summarize for listing
    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            version_id: self.version_id.clone(),
            parent_version_id: self.parent_version_id.clone(),
            created: self.created,
            file_count: self.full_file_list.len(),
            total_size: self.total_size(),
            options: self.options,
            changes: self.changes,
            sync: None,
        }
    }
}

/// Listing entry for one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub version_id: VersionId,
    pub parent_version_id: Option<VersionId>,
    pub created: DateTime<Utc>,
    pub file_count: usize,
    pub total_size: u64,
    pub options: BackupOptions,
    pub changes: ChangeCounts,
    /// Remote replication state, when a remote is configured
    pub sync: Option<SyncState>,
}

/// Why a committed version is not part of the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbandonReason {
    /// Committed by a run that never recorded it, and not adoptable
    Orphaned { detail: String },
    /// Removed from the tail of the chain by an explicit prune
    Pruned,
}

/// A committed version deliberately left out of the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbandonedVersion {
    pub version_id: VersionId,
    #[serde(flatten)]
    pub reason: AbandonReason,
    pub recorded_at: DateTime<Utc>,
}

/// On-disk index: append order plus abandoned versions
#[derive(Debug, Default, Serialize, Deserialize)]
struct ChainIndex {
    format: u32,
    versions: Vec<VersionId>,
    abandoned: Vec<AbandonedVersion>,
}

/// Owns the versioned history of manifests.
///
/// Manifests live in an arena indexed by version id; parents are resolved by
/// index lookup. The only mutations are `append`, `prune` of the tail and
/// recording abandoned versions.
#[derive(Debug)]
pub struct ManifestStore {
    manifests_path: PathBuf,
    index_path: PathBuf,
    order: Vec<VersionId>,
    arena: Vec<Manifest>,
    by_id: HashMap<VersionId, usize>,
    abandoned: Vec<AbandonedVersion>,
}

impl ManifestStore {
    /// Open (or create) a manifest store rooted at `root_path`
    pub fn open<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        let root_path = root_path.as_ref();
        let manifests_path = root_path.join("manifests");
        fs::create_dir_all(&manifests_path)?;
        let index_path = root_path.join("index.json");

        let index: ChainIndex = if index_path.exists() {
            read_json(&index_path)?
        } else {
            ChainIndex {
                format: MANIFEST_VERSION,
                ..ChainIndex::default()
            }
        };

        let mut store = Self {
            manifests_path,
            index_path,
            order: Vec::new(),
            arena: Vec::new(),
            by_id: HashMap::new(),
            abandoned: index.abandoned,
        };

        for id in index.versions {
            let path = store.manifest_path(&id);
            match read_json::<Manifest>(&path) {
                Ok(manifest) if manifest.version_id == id => {
                    store.by_id.insert(id.clone(), store.arena.len());
                    store.arena.push(manifest);
                }
                Ok(manifest) => {
                    warn!(
                        "Manifest file for {} declares version {}; treating as missing",
                        id, manifest.version_id
                    );
                }
                Err(e) => {
                    warn!("Manifest for {} is missing or unreadable: {}", id, e);
                }
            }
            store.order.push(id);
        }

        debug!(
            "Opened manifest store with {} versions ({} loaded)",
            store.order.len(),
            store.arena.len()
        );
        Ok(store)
    }

    /// Append a manifest as the new tail of the chain
    pub fn append(&mut self, manifest: Manifest) -> Result<()> {
        if self.order.contains(&manifest.version_id) {
            return Err(Error::InvalidManifest {
                reason: format!("Version {} is already recorded", manifest.version_id),
            });
        }
        if let Some(parent) = &manifest.parent_version_id {
            if self.latest_version_id() != Some(parent) {
                return Err(Error::InvalidManifest {
                    reason: format!(
                        "Parent {} is not the latest recorded version",
                        parent
                    ),
                });
            }
            if !self.by_id.contains_key(parent) {
                return Err(Error::ChainBroken {
                    version: parent.to_string(),
                    reason: "parent manifest is missing".to_string(),
                });
            }
        }

        persist_json(&self.manifest_path(&manifest.version_id), &manifest)?;

        let id = manifest.version_id.clone();
        self.by_id.insert(id.clone(), self.arena.len());
        self.arena.push(manifest);
        self.order.push(id.clone());
        self.abandoned.retain(|a| a.version_id != id);
        self.save_index()?;

        info!("Recorded version {}", id);
        Ok(())
    }

    /// Get a manifest by version id
    pub fn get(&self, id: &VersionId) -> Option<&Manifest> {
        self.by_id.get(id).map(|&idx| &self.arena[idx])
    }

    /// Whether the version is listed in the chain (loaded or not)
    pub fn contains(&self, id: &VersionId) -> bool {
        self.order.contains(id)
    }

    /// Id of the most recently appended version
    pub fn latest_version_id(&self) -> Option<&VersionId> {
        self.order.last()
    }

    /// The most recently appended manifest, if it could be loaded
    pub fn latest(&self) -> Option<&Manifest> {
        self.latest_version_id().and_then(|id| self.get(id))
    }

    /// All loaded manifests in append order
    pub fn list(&self) -> Vec<&Manifest> {
        self.order.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Versions listed in the index whose manifest could not be loaded
    pub fn missing_versions(&self) -> Vec<&VersionId> {
        self.order
            .iter()
            .filter(|id| !self.by_id.contains_key(*id))
            .collect()
    }

    /// Arena index of a manifest's parent
    pub fn parent_index(&self, idx: usize) -> Option<usize> {
        self.arena
            .get(idx)
            .and_then(|m| m.parent_version_id.as_ref())
            .and_then(|parent| self.by_id.get(parent).copied())
    }

    /// Resolve the chain from the root version to `id`, root first
    pub fn chain(&self, id: &VersionId) -> Result<Vec<&Manifest>> {
        let mut idx = match self.by_id.get(id) {
            Some(&idx) => idx,
            None if self.contains(id) => {
                return Err(Error::ChainBroken {
                    version: id.to_string(),
                    reason: "manifest is missing".to_string(),
                })
            }
            None => {
                return Err(Error::VersionNotFound {
                    version: id.to_string(),
                })
            }
        };

        let mut chain = vec![&self.arena[idx]];
        while let Some(parent) = &self.arena[idx].parent_version_id {
            idx = match self.parent_index(idx) {
                Some(parent_idx) => parent_idx,
                None => {
                    return Err(Error::ChainBroken {
                        version: parent.to_string(),
                        reason: format!("parent of {} is missing", self.arena[idx].version_id),
                    })
                }
            };
            if chain.len() > self.arena.len() {
                return Err(Error::ChainBroken {
                    version: id.to_string(),
                    reason: "parent links form a cycle".to_string(),
                });
            }
            chain.push(&self.arena[idx]);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Whether any recorded version names `id` as its parent
    pub fn has_descendants(&self, id: &VersionId) -> bool {
        self.arena
            .iter()
            .any(|m| m.parent_version_id.as_ref() == Some(id))
    }

    /// Remove a version from the tail of the chain
    pub fn prune(&mut self, id: &VersionId) -> Result<()> {
        if !self.contains(id) {
            return Err(Error::VersionNotFound {
                version: id.to_string(),
            });
        }
        if self.has_descendants(id) || self.latest_version_id() != Some(id) {
            return Err(Error::PruneRefused {
                version: id.to_string(),
                reason: "only the newest version without descendants can be pruned".to_string(),
            });
        }

        self.order.pop();
        if let Some(idx) = self.by_id.remove(id) {
            self.arena.remove(idx);
            self.reindex();
        }
        let path = self.manifest_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        self.abandoned.push(AbandonedVersion {
            version_id: id.clone(),
            reason: AbandonReason::Pruned,
            recorded_at: Utc::now(),
        });
        self.save_index()?;

        info!("Pruned version {}", id);
        Ok(())
    }

    /// Record a committed version as deliberately not part of the chain
    pub fn mark_abandoned(&mut self, id: &VersionId, detail: impl Into<String>) -> Result<()> {
        if self.is_abandoned(id) {
            return Ok(());
        }
        let detail = detail.into();
        warn!("Marking version {} abandoned: {}", id, detail);
        self.abandoned.push(AbandonedVersion {
            version_id: id.clone(),
            reason: AbandonReason::Orphaned { detail },
            recorded_at: Utc::now(),
        });
        self.save_index()
    }

    /// Whether the version was abandoned or pruned
    pub fn is_abandoned(&self, id: &VersionId) -> bool {
        self.abandoned.iter().any(|a| &a.version_id == id)
    }

    /// Abandoned and pruned versions
    pub fn abandoned(&self) -> &[AbandonedVersion] {
        &self.abandoned
    }

    fn reindex(&mut self) {
        self.by_id = self
            .arena
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.version_id.clone(), idx))
            .collect();
    }

    fn save_index(&self) -> Result<()> {
        let index = ChainIndex {
            format: MANIFEST_VERSION,
            versions: self.order.clone(),
            abandoned: self.abandoned.clone(),
        };
        persist_json(&self.index_path, &index)
    }

    fn manifest_path(&self, id: &VersionId) -> PathBuf {
        self.manifests_path.join(format!("{}.json", id))
    }
}

/// Write JSON atomically: temporary sibling first, then rename into place
pub(crate) fn persist_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(path: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            size: content.len() as u64,
            modified: Utc::now(),
            fingerprint: Fingerprint::of_bytes(content),
        }
    }

    fn manifest(id: &str, parent: Option<&str>, files: Vec<FileRecord>) -> Manifest {
        Manifest {
            format: MANIFEST_VERSION,
            version_id: VersionId::parse(id).unwrap(),
            parent_version_id: parent.map(|p| VersionId::parse(p).unwrap()),
            created: Utc::now(),
            full_file_list: files,
            options: BackupOptions::default(),
            changes: ChangeCounts::default(),
        }
    }

    #[test]
    fn test_version_id_validation() {
        assert!(VersionId::parse("v000001-abcdef").is_ok());
        assert!(VersionId::parse("3f2a9c").is_ok());
        assert!(VersionId::parse("").is_err());
        assert!(VersionId::parse("../escape").is_err());
        assert!(VersionId::parse("a/b").is_err());
    }

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative(Path::new("docs/a.txt")));
        assert!(!is_safe_relative(Path::new("/etc/passwd")));
        assert!(!is_safe_relative(Path::new("docs/../../x")));
        assert!(!is_safe_relative(Path::new("")));
    }

    #[test]
    fn test_append_and_reopen() -> Result<()> {
        let temp_dir = TempDir::new()?;
        {
            let mut store = ManifestStore::open(temp_dir.path())?;
            store.append(manifest("v1", None, vec![record("docs/a.txt", b"a")]))?;
            store.append(manifest("v2", Some("v1"), vec![record("docs/b.txt", b"b")]))?;
        }

        let store = ManifestStore::open(temp_dir.path())?;
        let ids: Vec<_> = store.list().iter().map(|m| m.version_id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["v1", "v2"]);
        assert_eq!(store.latest_version_id().map(|v| v.as_str()), Some("v2"));
        assert!(store.latest().unwrap().find_file("docs/b.txt").is_some());
        Ok(())
    }

    #[test]
    fn test_append_rejects_stale_parent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = ManifestStore::open(temp_dir.path())?;
        store.append(manifest("v1", None, vec![]))?;
        store.append(manifest("v2", Some("v1"), vec![]))?;

        let result = store.append(manifest("v3", Some("v1"), vec![]));
        assert!(matches!(result, Err(Error::InvalidManifest { .. })));

        let result = store.append(manifest("v2", Some("v2"), vec![]));
        assert!(matches!(result, Err(Error::InvalidManifest { .. })));
        Ok(())
    }

    #[test]
    fn test_chain_resolution_and_broken_parent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = ManifestStore::open(temp_dir.path())?;
        store.append(manifest("v1", None, vec![]))?;
        store.append(manifest("v2", Some("v1"), vec![]))?;
        store.append(manifest("v3", Some("v2"), vec![]))?;

        let chain: Vec<_> = store
            .chain(&VersionId::parse("v3")?)?
            .iter()
            .map(|m| m.version_id.as_str().to_string())
            .collect();
        assert_eq!(chain, vec!["v1", "v2", "v3"]);

        // Losing v2's manifest breaks everything after it, and must not look like a full backup
        fs::remove_file(temp_dir.path().join("manifests").join("v2.json"))?;
        let store = ManifestStore::open(temp_dir.path())?;
        assert_eq!(store.missing_versions().len(), 1);
        assert!(matches!(
            store.chain(&VersionId::parse("v3")?),
            Err(Error::ChainBroken { .. })
        ));
        assert!(matches!(
            store.chain(&VersionId::parse("v2")?),
            Err(Error::ChainBroken { .. })
        ));
        assert!(store.chain(&VersionId::parse("v1")?).is_ok());
        assert!(matches!(
            store.chain(&VersionId::parse("v9")?),
            Err(Error::VersionNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_prune_only_from_tail() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = ManifestStore::open(temp_dir.path())?;
        store.append(manifest("v1", None, vec![]))?;
        store.append(manifest("v2", Some("v1"), vec![]))?;

        let v1 = VersionId::parse("v1")?;
        let v2 = VersionId::parse("v2")?;
        assert!(matches!(store.prune(&v1), Err(Error::PruneRefused { .. })));

        store.prune(&v2)?;
        assert_eq!(store.latest_version_id(), Some(&v1));
        assert!(store.is_abandoned(&v2));
        assert!(!temp_dir.path().join("manifests").join("v2.json").exists());

        // The chain continues from v1 again
        store.append(manifest("v3", Some("v1"), vec![]))?;
        assert_eq!(store.chain(&VersionId::parse("v3")?)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_abandoned_versions_persist() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let orphan = VersionId::parse("deadbeef")?;
        {
            let mut store = ManifestStore::open(temp_dir.path())?;
            store.mark_abandoned(&orphan, "parent mismatch")?;
            store.mark_abandoned(&orphan, "parent mismatch")?;
        }
        let store = ManifestStore::open(temp_dir.path())?;
        assert!(store.is_abandoned(&orphan));
        assert_eq!(store.abandoned().len(), 1);
        Ok(())
    }
}
