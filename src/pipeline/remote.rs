//! Remote replication: the durable push queue and its retry policy.
//!
//! A version whose push fails (or times out) after a successful commit is
//! still recorded locally; it is queued here and retried with exponential
//! backoff. After `max_push_attempts` failures the entry is marked degraded
//! and only a forced retry touches it again.

use crate::manifest::{persist_json, read_json, VersionId};
use crate::storage::VersionStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::with_timeout;

/// Replication state of a recorded version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    Pending {
        attempts: u32,
        last_error: String,
        next_attempt: DateTime<Utc>,
    },
    Degraded {
        attempts: u32,
        last_error: String,
    },
}

/// Backoff strategy for push retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),

    /// Exponential: initial * 2^attempt (capped at max)
    Exponential { initial: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (0-based)
    pub fn calculate(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Exponential { initial, max } => {
                let multiplier = 2u32.saturating_pow(attempt);
                initial.saturating_mul(multiplier).min(*max)
            }
        }
    }
}

/// Timeouts and retry policy for store operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSettings {
    pub commit_timeout: Duration,
    pub push_timeout: Duration,
    pub pull_timeout: Duration,
    pub fetch_timeout: Duration,
    pub max_push_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(120),
            push_timeout: Duration::from_secs(300),
            pull_timeout: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(300),
            max_push_attempts: 8,
            backoff: BackoffStrategy::Exponential {
                initial: Duration::from_secs(30),
                max: Duration::from_secs(3600),
            },
        }
    }
}

/// A recorded version still waiting to reach the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPush {
    pub version_id: VersionId,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
    pub next_attempt: DateTime<Utc>,
    pub degraded: bool,
}

impl PendingPush {
    fn sync_state(&self) -> SyncState {
        if self.degraded {
            SyncState::Degraded {
                attempts: self.attempts,
                last_error: self.last_error.clone(),
            }
        } else {
            SyncState::Pending {
                attempts: self.attempts,
                last_error: self.last_error.clone(),
                next_attempt: self.next_attempt,
            }
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PushQueue {
    entries: Vec<PendingPush>,
}

/// Result of one retry pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Nothing queued, or nothing due yet
    Idle,
    /// The newest pending version reached the remote; the queue is empty
    Pushed { version_id: VersionId, cleared: usize },
    /// The push failed again
    Failed {
        version_id: VersionId,
        attempts: u32,
        degraded: bool,
        error: String,
    },
}

/// Durable push queue for one target
#[derive(Debug)]
pub struct RemoteSync {
    path: PathBuf,
    settings: RemoteSettings,
    queue: Mutex<PushQueue>,
}

impl RemoteSync {
    /// Load the queue persisted at `path` (empty if absent)
    pub fn open<P: AsRef<Path>>(path: P, settings: RemoteSettings) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let queue = load_queue(&path)?;
        Ok(Self {
            path,
            settings,
            queue: Mutex::new(queue),
        })
    }

    /// Re-read the queue from disk, picking up changes made by another process
    pub fn reload(&self) -> Result<()> {
        let queue = load_queue(&self.path)?;
        *self.queue.lock() = queue;
        Ok(())
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    /// Queue a version whose first push attempt failed
    pub fn enqueue(&self, version_id: &VersionId, error: &Error) -> Result<()> {
        let now = Utc::now();
        let mut queue = self.queue.lock();
        if queue.entries.iter().any(|e| &e.version_id == version_id) {
            return Ok(());
        }
        warn!("Push of {} failed, queued for retry: {}", version_id, error);
        queue.entries.push(PendingPush {
            version_id: version_id.clone(),
            enqueued_at: now,
            attempts: 1,
            last_error: error.to_string(),
            next_attempt: now + chrono_duration(self.settings.backoff.calculate(0)),
            degraded: false,
        });
        persist_json(&self.path, &*queue)
    }

    /// A push of `version_id` succeeded; it carried every earlier version too
    pub fn mark_pushed(&self, version_id: &VersionId) -> Result<usize> {
        let mut queue = self.queue.lock();
        let cleared = queue.entries.len();
        queue.entries.clear();
        if cleared > 0 {
            info!("Push of {} cleared {} queued versions", version_id, cleared);
            persist_json(&self.path, &*queue)?;
        }
        Ok(cleared)
    }

    /// Drop a version from the queue (e.g. after it was pruned)
    pub fn forget(&self, version_id: &VersionId) -> Result<()> {
        let mut queue = self.queue.lock();
        let before = queue.entries.len();
        queue.entries.retain(|e| &e.version_id != version_id);
        if queue.entries.len() != before {
            persist_json(&self.path, &*queue)?;
        }
        Ok(())
    }

    /// Replication state of a version
    pub fn state_of(&self, version_id: &VersionId) -> SyncState {
        self.queue
            .lock()
            .entries
            .iter()
            .find(|e| &e.version_id == version_id)
            .map(PendingPush::sync_state)
            .unwrap_or(SyncState::Synced)
    }

    /// Snapshot of the queue
    pub fn pending(&self) -> Vec<PendingPush> {
        self.queue.lock().entries.clone()
    }

    /// When the next automatic retry is due, if any
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue
            .lock()
            .entries
            .iter()
            .filter(|e| !e.degraded)
            .map(|e| e.next_attempt)
            .min()
    }

    /// Retry the newest queued version.
    ///
    /// Without `force` only entries whose backoff has elapsed and that are
    /// not degraded are considered; `force` retries regardless.
    pub async fn retry_pending(&self, store: &dyn VersionStore, force: bool) -> Result<RetryOutcome> {
        let now = Utc::now();
        let candidate = {
            let queue = self.queue.lock();
            queue
                .entries
                .iter()
                .filter(|e| force || (!e.degraded && e.next_attempt <= now))
                .max_by_key(|e| e.enqueued_at)
                .map(|e| e.version_id.clone())
        };
        let Some(version_id) = candidate else {
            return Ok(RetryOutcome::Idle);
        };

        let pushed = with_timeout(
            "push",
            self.settings.push_timeout,
            store.push(&version_id),
        )
        .await;

        match pushed {
            Ok(()) => {
                let cleared = self.mark_pushed(&version_id)?;
                Ok(RetryOutcome::Pushed {
                    version_id,
                    cleared,
                })
            }
            Err(e) if e.is_retryable() => self.record_failure(&version_id, &e),
            Err(e) => Err(e),
        }
    }

    fn record_failure(&self, version_id: &VersionId, error: &Error) -> Result<RetryOutcome> {
        let now = Utc::now();
        let mut queue = self.queue.lock();
        let mut outcome = RetryOutcome::Idle;

        for entry in queue.entries.iter_mut() {
            entry.attempts += 1;
            entry.last_error = error.to_string();
            entry.next_attempt = now + chrono_duration(self.settings.backoff.calculate(entry.attempts - 1));
            if entry.attempts >= self.settings.max_push_attempts && !entry.degraded {
                warn!(
                    "Giving up automatic pushes of {} after {} attempts",
                    entry.version_id, entry.attempts
                );
                entry.degraded = true;
            }
            if &entry.version_id == version_id {
                outcome = RetryOutcome::Failed {
                    version_id: version_id.clone(),
                    attempts: entry.attempts,
                    degraded: entry.degraded,
                    error: error.to_string(),
                };
            }
        }

        persist_json(&self.path, &*queue)?;
        Ok(outcome)
    }
}

fn load_queue(path: &Path) -> Result<PushQueue> {
    if path.exists() {
        read_json(path)
    } else {
        Ok(PushQueue::default())
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::hours(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DirStore;
    use tempfile::TempDir;

    fn settings(max_push_attempts: u32) -> RemoteSettings {
        RemoteSettings {
            max_push_attempts,
            backoff: BackoffStrategy::Fixed(Duration::ZERO),
            ..RemoteSettings::default()
        }
    }

    fn remote_error() -> Error {
        Error::Remote {
            reason: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = BackoffStrategy::Exponential {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.calculate(0), Duration::from_secs(10));
        assert_eq!(backoff.calculate(1), Duration::from_secs(20));
        assert_eq!(backoff.calculate(2), Duration::from_secs(40));
        assert_eq!(backoff.calculate(3), Duration::from_secs(60));
        assert_eq!(backoff.calculate(40), Duration::from_secs(60));
    }

    #[test]
    fn test_queue_survives_restart() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("push_queue.json");
        let id = VersionId::parse("v000001-abc")?;
        {
            let sync = RemoteSync::open(&path, settings(3))?;
            sync.enqueue(&id, &remote_error())?;
        }
        let sync = RemoteSync::open(&path, settings(3))?;
        assert!(matches!(sync.state_of(&id), SyncState::Pending { attempts: 1, .. }));
        assert_eq!(sync.state_of(&VersionId::parse("other")?), SyncState::Synced);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_degrades_then_recovers() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let blocked = temp_dir.path().join("blocked");
        std::fs::write(&blocked, b"")?;
        let store = DirStore::new(temp_dir.path().join("store"), Some(blocked.clone()));

        let artifact = temp_dir.path().join("a.artifact");
        std::fs::write(&artifact, b"payload")?;
        let id = store.commit(&artifact, "v1").await?;

        let sync = RemoteSync::open(temp_dir.path().join("queue.json"), settings(3))?;
        sync.enqueue(&id, &remote_error())?;

        let outcome = sync.retry_pending(&store, false).await?;
        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 2, degraded: false, .. }));
        let outcome = sync.retry_pending(&store, false).await?;
        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 3, degraded: true, .. }));
        assert!(matches!(sync.state_of(&id), SyncState::Degraded { .. }));

        // Degraded entries are skipped unless forced
        assert_eq!(sync.retry_pending(&store, false).await?, RetryOutcome::Idle);

        // Remote comes back
        std::fs::remove_file(&blocked)?;
        let outcome = sync.retry_pending(&store, true).await?;
        assert_eq!(
            outcome,
            RetryOutcome::Pushed {
                version_id: id.clone(),
                cleared: 1
            }
        );
        assert_eq!(sync.state_of(&id), SyncState::Synced);
        assert!(blocked.join("objects").exists());
        Ok(())
    }
}
