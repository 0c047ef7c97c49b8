//! Content fingerprints using BLAKE3

use crate::Result;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

/// A content fingerprint: the BLAKE3 digest of a file's bytes, as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an existing hex digest
    pub fn new(hex: String) -> Self {
        Self(hex)
    }

    /// Get the fingerprint as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fingerprint a byte slice
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    /// Fingerprint a file in streaming fashion
    pub fn of_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Hasher::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(Self(hasher.finalize().to_hex().to_string()))
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_of_bytes() {
        let fp = Fingerprint::of_bytes(b"hello world");

        // BLAKE3 hash of "hello world"
        assert_eq!(
            fp.as_str(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
        assert_eq!(fp.short(), "d74981efa70a");
    }

    #[test]
    fn test_file_and_bytes_agree() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("data.bin");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data)?;

        assert_eq!(Fingerprint::of_file(&path)?, Fingerprint::of_bytes(&data));
        Ok(())
    }
}
