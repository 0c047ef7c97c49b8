//! # AutoStash
//!
//! Incremental personal backups with versioned, integrity-checked storage.
//!
//! ## Features
//!
//! - **Change detection**: BLAKE3 fingerprints with an mtime pre-filter
//! - **Incremental versions**: each version ships only its change set; manifests
//!   record the full tree so any version can be rebuilt by replaying its chain
//! - **Versioned storage**: artifacts are committed to git or a plain directory
//!   and replicated to a remote, with a durable retry queue
//! - **Encryption**: ChaCha20-Poly1305 (feature `encryption`) or gpg
//! - **Scheduling**: daily, weekly, monthly or custom cadence with persisted state
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use autostash::{Config, Engine};
//!
//! # #[tokio::main]
//! # async fn main() -> autostash::Result<()> {
//! let engine = Engine::open(Config::load()?).await?;
//! let outcome = engine.backup_blocking("documents").await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod changeset;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod manifest;
pub mod packager;
pub mod pipeline;
pub mod scanner;
pub mod scheduler;
pub mod storage;
pub mod verify;

// Re-export commonly used types
pub use changeset::ChangeSet;
pub use config::Config;
pub use engine::{Engine, RunId};
pub use error::{Error, ErrorKind, Result};
pub use fingerprint::Fingerprint;
pub use manifest::{FileRecord, Manifest, ManifestStore, VersionId};
pub use pipeline::{RestoreOptions, RunOutcome, RunStatus};
pub use scheduler::{Frequency, ScheduleState, Scheduler};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
