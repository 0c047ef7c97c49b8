//! Git-backed version store driving the `git` CLI

use super::{VersionStore, ARTIFACT_FILE_NAME};
use crate::manifest::VersionId;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

const COMMIT_IDENTITY: [&str; 4] = [
    "-c",
    "user.name=AutoStash",
    "-c",
    "user.email=autostash@localhost",
];

/// Stderr fragments that indicate a credential problem rather than a network one
const AUTH_FAILURES: &[&str] = &[
    "authentication failed",
    "permission denied",
    "could not read username",
    "could not read password",
    "invalid credentials",
    "403",
];

/// Version store over a local git worktree, optionally pushed to a remote.
///
/// Each version is one commit whose tree holds a single artifact file; the
/// commit hash is the version id.
#[derive(Debug, Clone)]
pub struct GitStore {
    worktree: PathBuf,
    remote: Option<String>,
    branch: String,
    program: String,
}

impl GitStore {
    pub fn new<P: AsRef<Path>>(worktree: P, remote: Option<String>, branch: impl Into<String>) -> Self {
        Self {
            worktree: worktree.as_ref().to_path_buf(),
            remote,
            branch: branch.into(),
            program: "git".to_string(),
        }
    }

    /// Create the worktree and repository if needed, and point `origin` at the remote
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.worktree).await?;

        if !self.worktree.join(".git").exists() {
            info!("Initializing git repository at {}", self.worktree.display());
            self.git_checked(&["init", "--quiet"]).await?;
            let head = format!("refs/heads/{}", self.branch);
            self.git_checked(&["symbolic-ref", "HEAD", head.as_str()]).await?;
        }

        if let Some(remote) = &self.remote {
            let existing = self.git(&["remote", "get-url", "origin"]).await?;
            if !existing.status.success() {
                self.git_checked(&["remote", "add", "origin", remote.as_str()]).await?;
            } else if String::from_utf8_lossy(&existing.stdout).trim() != remote.as_str() {
                self.git_checked(&["remote", "set-url", "origin", remote.as_str()]).await?;
            }
        }
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        debug!("git {}", args.join(" "));
        Command::new(&self.program)
            .args(args)
            .current_dir(&self.worktree)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Storage {
                reason: format!("Failed to execute git: {}", e),
            })
    }

    /// Run a local git command, mapping failure to a storage error
    async fn git_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(Error::Storage {
                reason: format!(
                    "git {} failed: {}",
                    args.first().unwrap_or(&""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output)
    }

    /// Run a git command that talks to the remote
    async fn git_remote(&self, args: &[&str]) -> Result<Output> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(classify_remote_failure(
                args.first().unwrap_or(&""),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(output)
    }
}

fn classify_remote_failure(operation: &str, stderr: &str) -> Error {
    let lowered = stderr.to_lowercase();
    let reason = format!("git {} failed: {}", operation, stderr.trim());
    if AUTH_FAILURES.iter().any(|pattern| lowered.contains(pattern)) {
        Error::Auth { reason }
    } else {
        Error::Remote { reason }
    }
}

fn stdout_line(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[async_trait]
impl VersionStore for GitStore {
    fn describe(&self) -> String {
        format!("git:{}", self.worktree.display())
    }

    fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    async fn commit(&self, artifact_path: &Path, message: &str) -> Result<VersionId> {
        tokio::fs::copy(artifact_path, self.worktree.join(ARTIFACT_FILE_NAME)).await?;
        self.git_checked(&["add", "--", ARTIFACT_FILE_NAME]).await?;

        let mut args = COMMIT_IDENTITY.to_vec();
        args.extend(["commit", "--quiet", "--allow-empty", "-m", message]);
        self.git_checked(&args).await?;

        let output = self.git_checked(&["rev-parse", "HEAD"]).await?;
        let id = VersionId::parse(stdout_line(&output))?;
        info!("Committed version {}", id);
        Ok(id)
    }

    async fn push(&self, id: &VersionId) -> Result<()> {
        if self.remote.is_none() {
            return Ok(());
        }
        let refspec = format!("{}:refs/heads/{}", id, self.branch);
        self.git_remote(&["push", "--quiet", "origin", refspec.as_str()]).await?;
        info!("Pushed {} to origin/{}", id, self.branch);
        Ok(())
    }

    async fn pull(&self) -> Result<()> {
        if self.remote.is_none() {
            return Ok(());
        }
        self.git_remote(&["fetch", "--quiet", "origin", self.branch.as_str()]).await?;

        let has_head = self.git(&["rev-parse", "--verify", "-q", "HEAD"]).await?;
        if has_head.status.success() {
            self.git_checked(&["merge", "--ff-only", "--quiet", "FETCH_HEAD"]).await?;
        } else {
            self.git_checked(&["reset", "--quiet", "--hard", "FETCH_HEAD"]).await?;
        }
        Ok(())
    }

    async fn fetch(&self, id: &VersionId) -> Result<Vec<u8>> {
        let object = format!("{}:{}", id, ARTIFACT_FILE_NAME);
        let output = self.git(&["show", object.as_str()]).await?;
        if !output.status.success() {
            return Err(Error::Storage {
                reason: format!(
                    "Cannot read artifact of {}: {}",
                    id,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }

    async fn latest(&self) -> Result<Option<VersionId>> {
        let output = self.git(&["rev-parse", "--verify", "-q", "HEAD"]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        VersionId::parse(stdout_line(&output)).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_failure_classification() {
        let err = classify_remote_failure(
            "push",
            "fatal: Authentication failed for 'https://example.com/repo.git/'",
        );
        assert!(matches!(err, Error::Auth { .. }));

        let err = classify_remote_failure("push", "fatal: unable to access: Could not resolve host");
        assert!(matches!(err, Error::Remote { .. }));
    }
}
