//! Version stores: where committed artifacts live.
//!
//! A [`VersionStore`] commits an artifact file as a new version, replicates it
//! to a remote, and fetches the bytes back by id. [`GitStore`] drives the `git`
//! CLI; [`DirStore`] keeps artifacts in a plain directory with an optional
//! mirror directory acting as the remote.

mod dir;
mod git;

pub use dir::DirStore;
pub use git::GitStore;

use crate::manifest::VersionId;
use crate::Result;
use async_trait::async_trait;
use std::path::Path;

/// File name of the artifact inside a git worktree
pub const ARTIFACT_FILE_NAME: &str = "autostash.artifact";

/// The versioned object store behind a target
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Human-readable backend name for logs
    fn describe(&self) -> String;

    /// Whether a remote is configured for push/pull
    fn has_remote(&self) -> bool;

    /// Record the artifact at `artifact_path` as a new version
    async fn commit(&self, artifact_path: &Path, message: &str) -> Result<VersionId>;

    /// Replicate a committed version (and its ancestors) to the remote
    async fn push(&self, id: &VersionId) -> Result<()>;

    /// Bring remote versions into the local store
    async fn pull(&self) -> Result<()>;

    /// Read back the artifact bytes of a version
    async fn fetch(&self, id: &VersionId) -> Result<Vec<u8>>;

    /// The most recently committed version, if any
    async fn latest(&self) -> Result<Option<VersionId>>;
}
