//! Directory-backed version store

use super::VersionStore;
use crate::fingerprint::Fingerprint;
use crate::manifest::VersionId;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const OBJECTS_DIR: &str = "objects";
const HEAD_FILE: &str = "HEAD";

/// Version store over a plain directory.
///
/// Artifacts are kept as `objects/<id>.artifact` with ids of the form
/// `v000042-<hash>`; `HEAD` names the latest. An optional mirror directory
/// with the same layout plays the role of the remote.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
    mirror: Option<PathBuf>,
}

impl DirStore {
    pub fn new<P: AsRef<Path>>(root: P, mirror: Option<PathBuf>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            mirror,
        }
    }

    fn object_path(root: &Path, id: &VersionId) -> PathBuf {
        root.join(OBJECTS_DIR).join(format!("{}.artifact", id))
    }

    fn sequence(id: &VersionId) -> u64 {
        id.as_str()
            .strip_prefix('v')
            .and_then(|rest| rest.split('-').next())
            .and_then(|seq| seq.parse().ok())
            .unwrap_or(0)
    }

    async fn read_head(root: &Path) -> Result<Option<VersionId>> {
        match fs::read_to_string(root.join(HEAD_FILE)).await {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => VersionId::parse(content.trim()).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy one object into another store directory unless it is already there
    async fn replicate(from: &Path, to: &Path, id: &VersionId) -> std::io::Result<()> {
        let target = Self::object_path(to, id);
        if fs::metadata(&target).await.is_err() {
            let bytes = fs::read(Self::object_path(from, id)).await?;
            write_atomic(&target, &bytes).await?;
        }
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp = path.with_extension("tmp");
    fs::write(&temp, bytes).await?;
    fs::rename(&temp, path).await
}

fn storage(e: std::io::Error) -> Error {
    Error::Storage {
        reason: e.to_string(),
    }
}

fn remote(e: std::io::Error) -> Error {
    Error::Remote {
        reason: e.to_string(),
    }
}

#[async_trait]
impl VersionStore for DirStore {
    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    fn has_remote(&self) -> bool {
        self.mirror.is_some()
    }

    async fn commit(&self, artifact_path: &Path, _message: &str) -> Result<VersionId> {
        let bytes = fs::read(artifact_path).await?;
        let seq = Self::read_head(&self.root)
            .await?
            .map(|id| Self::sequence(&id))
            .unwrap_or(0)
            + 1;
        let id = VersionId::parse(format!(
            "v{:06}-{}",
            seq,
            Fingerprint::of_bytes(&bytes).short()
        ))?;

        write_atomic(&Self::object_path(&self.root, &id), &bytes)
            .await
            .map_err(storage)?;
        write_atomic(&self.root.join(HEAD_FILE), id.as_str().as_bytes())
            .await
            .map_err(storage)?;

        info!("Committed version {}", id);
        Ok(id)
    }

    async fn push(&self, id: &VersionId) -> Result<()> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };

        // Push carries every local version the mirror lacks, like a git push of a branch tip
        let mut entries = fs::read_dir(self.root.join(OBJECTS_DIR)).await.map_err(storage)?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(storage)? {
            let name = entry.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".artifact")) {
                if let Ok(local) = VersionId::parse(stem) {
                    if Self::sequence(&local) <= Self::sequence(id) {
                        ids.push(local);
                    }
                }
            }
        }

        for local in &ids {
            Self::replicate(&self.root, mirror, local).await.map_err(remote)?;
        }
        let mirror_head = Self::read_head(mirror).await.map_err(|e| Error::Remote {
            reason: e.to_string(),
        })?;
        if mirror_head.map_or(true, |head| Self::sequence(&head) < Self::sequence(id)) {
            write_atomic(&mirror.join(HEAD_FILE), id.as_str().as_bytes())
                .await
                .map_err(remote)?;
        }

        info!("Pushed {} to {}", id, mirror.display());
        Ok(())
    }

    async fn pull(&self) -> Result<()> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        let Some(remote_head) = Self::read_head(mirror).await.map_err(|e| Error::Remote {
            reason: e.to_string(),
        })?
        else {
            return Ok(());
        };

        let local_head = Self::read_head(&self.root).await?;
        if local_head
            .as_ref()
            .is_some_and(|head| Self::sequence(head) >= Self::sequence(&remote_head))
        {
            return Ok(());
        }

        let mut entries = fs::read_dir(mirror.join(OBJECTS_DIR)).await.map_err(remote)?;
        while let Some(entry) = entries.next_entry().await.map_err(remote)? {
            let name = entry.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".artifact")) {
                if let Ok(id) = VersionId::parse(stem) {
                    Self::replicate(mirror, &self.root, &id).await.map_err(storage)?;
                }
            }
        }
        write_atomic(&self.root.join(HEAD_FILE), remote_head.as_str().as_bytes())
            .await
            .map_err(storage)?;
        debug!("Pulled up to {}", remote_head);
        Ok(())
    }

    async fn fetch(&self, id: &VersionId) -> Result<Vec<u8>> {
        match fs::read(Self::object_path(&self.root, id)).await {
            Ok(bytes) => Ok(bytes),
            Err(local_err) => match &self.mirror {
                Some(mirror) => fs::read(Self::object_path(mirror, id))
                    .await
                    .map_err(|e| Error::Storage {
                        reason: format!("Artifact {} is missing locally ({}) and remotely ({})", id, local_err, e),
                    }),
                None => Err(Error::Storage {
                    reason: format!("Artifact {} is missing: {}", id, local_err),
                }),
            },
        }
    }

    async fn latest(&self) -> Result<Option<VersionId>> {
        Self::read_head(&self.root).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_commit_fetch_latest() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = DirStore::new(temp_dir.path().join("store"), None);
        assert_eq!(store.latest().await?, None);

        let artifact = temp_dir.path().join("a.artifact");
        std::fs::write(&artifact, b"first")?;
        let v1 = store.commit(&artifact, "first").await?;
        std::fs::write(&artifact, b"second")?;
        let v2 = store.commit(&artifact, "second").await?;

        assert!(v1.as_str().starts_with("v000001-"));
        assert!(v2.as_str().starts_with("v000002-"));
        assert_eq!(store.latest().await?, Some(v2.clone()));
        assert_eq!(store.fetch(&v1).await?, b"first");
        assert_eq!(store.fetch(&v2).await?, b"second");
        assert!(matches!(
            store.fetch(&VersionId::parse("v000009-none")?).await,
            Err(Error::Storage { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_push_and_pull_through_mirror() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mirror = temp_dir.path().join("mirror");
        let first = DirStore::new(temp_dir.path().join("one"), Some(mirror.clone()));
        let second = DirStore::new(temp_dir.path().join("two"), Some(mirror.clone()));

        let artifact = temp_dir.path().join("a.artifact");
        std::fs::write(&artifact, b"payload")?;
        let v1 = first.commit(&artifact, "v1").await?;
        first.push(&v1).await?;

        second.pull().await?;
        assert_eq!(second.latest().await?, Some(v1.clone()));
        assert_eq!(second.fetch(&v1).await?, b"payload");
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_mirror_is_remote_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        // A regular file where the mirror directory should be
        let blocked = temp_dir.path().join("blocked");
        std::fs::write(&blocked, b"")?;
        let store = DirStore::new(temp_dir.path().join("store"), Some(blocked));

        let artifact = temp_dir.path().join("a.artifact");
        std::fs::write(&artifact, b"payload")?;
        let v1 = store.commit(&artifact, "v1").await?;
        assert!(matches!(store.push(&v1).await, Err(Error::Remote { .. })));
        Ok(())
    }
}
