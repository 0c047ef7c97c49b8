//! Error types for AutoStash

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for AutoStash operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Cannot read {path}: {reason}")]
    Scan { path: PathBuf, reason: String },

    #[error("Integrity verification failed: {reason}")]
    Integrity { reason: String, paths: Vec<PathBuf> },

    #[error("Version chain broken at {version}: {reason}")]
    ChainBroken { version: String, reason: String },

    #[error("Crypto error: {reason}")]
    Crypto { reason: String },

    #[error("Remote error: {reason}")]
    Remote { reason: String },

    #[error("Authentication error: {reason}")]
    Auth { reason: String },

    #[error("Storage backend error: {reason}")]
    Storage { reason: String },

    #[error("A backup run is already active for target '{target}'")]
    ConcurrentRun { target: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Version not found: {version}")]
    VersionNotFound { version: String },

    #[error("Invalid manifest format: {reason}")]
    InvalidManifest { reason: String },

    #[error("Cannot prune {version}: {reason}")]
    PruneRefused { version: String, reason: String },

    #[error("Unknown target: {name}")]
    UnknownTarget { name: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Scheduling error: {reason}")]
    Scheduling { reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification of an [`Error`], reported in run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Scan,
    Integrity,
    ChainBroken,
    Crypto,
    Remote,
    Auth,
    ConcurrentRun,
    Storage,
    Timeout,
    NotFound,
    PruneRefused,
    Config,
    Io,
    Serialization,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Scan => "scan",
            ErrorKind::Integrity => "integrity",
            ErrorKind::ChainBroken => "chain-broken",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Remote => "remote",
            ErrorKind::Auth => "auth",
            ErrorKind::ConcurrentRun => "concurrent-run",
            ErrorKind::Storage => "storage",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not-found",
            ErrorKind::PruneRefused => "prune-refused",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) | Error::InvalidManifest { .. } => ErrorKind::Serialization,
            Error::TomlParse(_) | Error::TomlSerialize(_) => ErrorKind::Config,
            Error::Configuration { .. } | Error::UnknownTarget { .. } => ErrorKind::Config,
            Error::Scheduling { .. } => ErrorKind::Config,
            Error::Scan { .. } => ErrorKind::Scan,
            Error::Integrity { .. } => ErrorKind::Integrity,
            Error::ChainBroken { .. } => ErrorKind::ChainBroken,
            Error::Crypto { .. } => ErrorKind::Crypto,
            Error::Remote { .. } => ErrorKind::Remote,
            Error::Auth { .. } => ErrorKind::Auth,
            Error::Storage { .. } => ErrorKind::Storage,
            Error::ConcurrentRun { .. } => ErrorKind::ConcurrentRun,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::VersionNotFound { .. } => ErrorKind::NotFound,
            Error::PruneRefused { .. } => ErrorKind::PruneRefused,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Paths affected by this error, if any
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            Error::Scan { path, .. } => vec![path.clone()],
            Error::Integrity { paths, .. } => paths.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether a push/pull failing with this error is worth retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Remote | ErrorKind::Auth | ErrorKind::Timeout
        )
    }

    pub(crate) fn integrity(reason: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Error::Integrity {
            reason: reason.into(),
            paths,
        }
    }
}

/// Result type alias for AutoStash operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let err = Error::integrity("mismatch", vec![PathBuf::from("docs/a.txt")]);
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.paths(), vec![PathBuf::from("docs/a.txt")]);

        let err = Error::Remote {
            reason: "connection reset".to_string(),
        };
        assert!(err.is_retryable());

        let err = Error::Crypto {
            reason: "bad key".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind().to_string(), "crypto");
    }
}
