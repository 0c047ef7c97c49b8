//! Backup artifacts: the serialized form of one version's change set.
//!
//! Layout:
//!
//! ```text
//! MAGIC (8 bytes) | header length (u64 LE) | header JSON | payload
//! ```
//!
//! The header is never encrypted, so a restore can be planned from it without
//! the key. Payload entries are compressed first, then encrypted.

use crate::changeset::ChangeSet;
use crate::crypto::{Cipher, KeyRef};
use crate::fingerprint::Fingerprint;
use crate::manifest::{is_safe_relative, ChangeCounts, FileRecord, ManifestHeader};
use crate::scanner::TreeSnapshot;
use crate::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, span, warn, Level};

/// Leading bytes of every artifact
pub const ARTIFACT_MAGIC: &[u8; 8] = b"ASTASH01";

/// Artifact header format version
pub const ARTIFACT_FORMAT: u32 = 1;

const PREAMBLE_LEN: usize = ARTIFACT_MAGIC.len() + 8;

/// One entry of an artifact's change set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactEntry {
    Added {
        record: FileRecord,
        offset: u64,
        length: u64,
    },
    Modified {
        previous: FileRecord,
        record: FileRecord,
        offset: u64,
        length: u64,
    },
    Deleted {
        path: PathBuf,
    },
}

impl ArtifactEntry {
    pub fn path(&self) -> &Path {
        match self {
            ArtifactEntry::Added { record, .. } | ArtifactEntry::Modified { record, .. } => {
                &record.path
            }
            ArtifactEntry::Deleted { path } => path,
        }
    }

    fn content(&self) -> Option<(&FileRecord, u64, u64)> {
        match self {
            ArtifactEntry::Added {
                record,
                offset,
                length,
            }
            | ArtifactEntry::Modified {
                record,
                offset,
                length,
                ..
            } => Some((record, *offset, *length)),
            ArtifactEntry::Deleted { .. } => None,
        }
    }
}

/// Unencrypted artifact header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub format: u32,
    pub manifest: ManifestHeader,
    pub compressed: bool,
    pub encrypted: bool,
    /// Name of the cipher that sealed the payload
    pub cipher: Option<String>,
    pub key_ref: Option<KeyRef>,
    pub entries: Vec<ArtifactEntry>,
}

impl ArtifactHeader {
    /// Rebuild the change set described by the entries
    pub fn change_set(&self) -> ChangeSet {
        let mut change_set = ChangeSet::default();
        for entry in &self.entries {
            match entry {
                ArtifactEntry::Added { record, .. } => change_set.added.push(record.clone()),
                ArtifactEntry::Modified {
                    previous, record, ..
                } => change_set.modified.push((previous.clone(), record.clone())),
                ArtifactEntry::Deleted { path } => change_set.deleted.push(path.clone()),
            }
        }
        change_set.sort();
        change_set
    }

    fn validate(&self, payload_len: usize) -> Result<()> {
        if self.format != ARTIFACT_FORMAT {
            return Err(Error::integrity(
                format!("unsupported artifact format {}", self.format),
                Vec::new(),
            ));
        }

        let unsafe_paths: Vec<PathBuf> = self
            .entries
            .iter()
            .map(|e| e.path())
            .chain(self.manifest.full_file_list.iter().map(|r| r.path.as_path()))
            .filter(|p| !is_safe_relative(p))
            .map(Path::to_path_buf)
            .collect();
        if !unsafe_paths.is_empty() {
            return Err(Error::integrity("artifact names unsafe paths", unsafe_paths));
        }

        let out_of_range: Vec<PathBuf> = self
            .entries
            .iter()
            .filter_map(ArtifactEntry::content)
            .filter(|(_, offset, length)| {
                offset
                    .checked_add(*length)
                    .map_or(true, |end| end > payload_len as u64)
            })
            .map(|(r, _, _)| r.path.clone())
            .collect();
        if !out_of_range.is_empty() {
            return Err(Error::integrity(
                "payload is truncated or entry offsets are out of range",
                out_of_range,
            ));
        }
        Ok(())
    }
}

/// A serialized change set: header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub header: ArtifactHeader,
    pub payload: Vec<u8>,
}

impl BackupArtifact {
    /// Serialize to the on-disk layout
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)?;
        let mut out = Vec::with_capacity(PREAMBLE_LEN + header.len() + self.payload.len());
        out.extend_from_slice(ARTIFACT_MAGIC);
        out.extend_from_slice(&(header.len() as u64).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse the on-disk layout; structural problems are integrity errors
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, payload_start) = parse_header(bytes)?;
        let payload = bytes[payload_start..].to_vec();
        header.validate(payload.len())?;
        Ok(Self { header, payload })
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.encode()?)?;
        Ok(())
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::decode(&fs::read(path)?)
    }
}

/// Decode only the header of an artifact
pub fn read_header(bytes: &[u8]) -> Result<ArtifactHeader> {
    parse_header(bytes).map(|(header, _)| header)
}

fn parse_header(bytes: &[u8]) -> Result<(ArtifactHeader, usize)> {
    if bytes.len() < PREAMBLE_LEN || &bytes[..ARTIFACT_MAGIC.len()] != ARTIFACT_MAGIC {
        return Err(Error::integrity("not a backup artifact (bad magic)", Vec::new()));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[ARTIFACT_MAGIC.len()..PREAMBLE_LEN]);
    let header_len = u64::from_le_bytes(len_bytes);

    let header_end = usize::try_from(header_len)
        .ok()
        .and_then(|len| PREAMBLE_LEN.checked_add(len))
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::integrity("artifact header is truncated", Vec::new()))?;

    let header: ArtifactHeader = serde_json::from_slice(&bytes[PREAMBLE_LEN..header_end])
        .map_err(|e| Error::integrity(format!("artifact header is malformed: {}", e), Vec::new()))?;
    Ok((header, header_end))
}

/// Key material for sealing or opening payloads
#[derive(Clone)]
pub struct Encryption {
    pub cipher: Arc<dyn Cipher>,
    pub key: KeyRef,
}

impl std::fmt::Debug for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryption")
            .field("cipher", &self.cipher.name())
            .field("key", &self.key)
            .finish()
    }
}

/// Where the packager reads file content from
pub trait ContentSource {
    fn read(&self, record: &FileRecord) -> Result<Vec<u8>>;
}

impl ContentSource for TreeSnapshot {
    fn read(&self, record: &FileRecord) -> Result<Vec<u8>> {
        let path = self
            .absolute_path(&record.path)
            .ok_or_else(|| Error::Scan {
                path: record.path.clone(),
                reason: "path does not belong to any watched root".to_string(),
            })?;
        Ok(fs::read(path)?)
    }
}

impl ContentSource for BTreeMap<PathBuf, Vec<u8>> {
    fn read(&self, record: &FileRecord) -> Result<Vec<u8>> {
        self.get(&record.path).cloned().ok_or_else(|| Error::Scan {
            path: record.path.clone(),
            reason: "no content available".to_string(),
        })
    }
}

/// Serialize a change set into an artifact.
///
/// Content is re-fingerprinted as it is read; a file that changed since the
/// scan fails the pack with an integrity error naming it. A file that
/// vanished or became unreadable is left out instead: an added file is
/// dropped from the version, a modified one keeps its previous record. The
/// header's file list and counts are adjusted to match, so the artifact still
/// replays onto its parent.
pub fn pack(
    change_set: &ChangeSet,
    mut manifest: ManifestHeader,
    source: &dyn ContentSource,
    encryption: Option<&Encryption>,
) -> Result<BackupArtifact> {
    let span = span!(
        Level::INFO,
        "pack",
        entries = change_set.added.len() + change_set.modified.len()
    );
    let _enter = span.enter();

    let compressed = manifest.options.compression;
    let encrypted = manifest.options.encryption;
    let sealer = match (encrypted, encryption) {
        (true, Some(encryption)) => Some(encryption),
        (true, None) => {
            return Err(Error::Configuration {
                reason: "encryption is enabled but no key is configured".to_string(),
            })
        }
        (false, _) => None,
    };

    let mut payload = Vec::new();
    let mut entries = Vec::new();
    let mut changed = Vec::new();
    let mut dropped: Vec<PathBuf> = Vec::new();
    let mut reverted: Vec<FileRecord> = Vec::new();

    let mut push_content =
        |record: &FileRecord, payload: &mut Vec<u8>| -> Result<Option<(u64, u64)>> {
            let bytes = match source.read(record) {
                Ok(bytes) => bytes,
                Err(e) if is_vanished(&e) => {
                    warn!("Leaving {} out of this version: {}", record.path.display(), e);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            if bytes.len() as u64 != record.size
                || Fingerprint::of_bytes(&bytes) != record.fingerprint
            {
                changed.push(record.path.clone());
                return Ok(Some((payload.len() as u64, 0)));
            }
            let encoded = encode_content(bytes, compressed, sealer)?;
            let offset = payload.len() as u64;
            payload.extend_from_slice(&encoded);
            Ok(Some((offset, encoded.len() as u64)))
        };

    for record in &change_set.added {
        match push_content(record, &mut payload)? {
            Some((offset, length)) => entries.push(ArtifactEntry::Added {
                record: record.clone(),
                offset,
                length,
            }),
            None => dropped.push(record.path.clone()),
        }
    }
    for (previous, record) in &change_set.modified {
        match push_content(record, &mut payload)? {
            Some((offset, length)) => entries.push(ArtifactEntry::Modified {
                previous: previous.clone(),
                record: record.clone(),
                offset,
                length,
            }),
            None => reverted.push(previous.clone()),
        }
    }
    for path in &change_set.deleted {
        entries.push(ArtifactEntry::Deleted { path: path.clone() });
    }

    if !changed.is_empty() {
        return Err(Error::integrity(
            "files changed between scan and pack",
            changed,
        ));
    }

    if !dropped.is_empty() || !reverted.is_empty() {
        manifest.full_file_list.retain(|r| !dropped.contains(&r.path));
        for previous in reverted {
            if let Some(slot) = manifest
                .full_file_list
                .iter_mut()
                .find(|r| r.path == previous.path)
            {
                *slot = previous;
            }
        }
        manifest.changes = ChangeCounts {
            added: entries
                .iter()
                .filter(|e| matches!(e, ArtifactEntry::Added { .. }))
                .count(),
            modified: entries
                .iter()
                .filter(|e| matches!(e, ArtifactEntry::Modified { .. }))
                .count(),
            deleted: change_set.deleted.len(),
        };
    }

    debug!("Packed {} entries into {} payload bytes", entries.len(), payload.len());

    Ok(BackupArtifact {
        header: ArtifactHeader {
            format: ARTIFACT_FORMAT,
            manifest,
            compressed,
            encrypted,
            cipher: sealer.map(|s| s.cipher.name().to_string()),
            key_ref: sealer.map(|s| s.key.clone()),
            entries,
        },
        payload,
    })
}

/// A file that disappeared or lost its permissions after the scan
fn is_vanished(error: &Error) -> bool {
    matches!(
        error,
        Error::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
        )
    )
}

/// A decoded artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedArtifact {
    pub header: ArtifactHeader,
    pub change_set: ChangeSet,
    /// Content of every added or modified file, keyed by path
    pub contents: BTreeMap<PathBuf, Vec<u8>>,
}

/// Decoded artifact plus any entries whose content failed verification
#[derive(Debug, Clone)]
pub struct Inspection {
    pub unpacked: UnpackedArtifact,
    pub mismatched: Vec<PathBuf>,
}

/// Decode every entry, collecting the ones whose content does not match its
/// declared fingerprint instead of failing on the first.
pub fn inspect(artifact: &BackupArtifact, encryption: Option<&Encryption>) -> Result<Inspection> {
    let header = &artifact.header;
    header.validate(artifact.payload.len())?;

    let opener = match (header.encrypted, encryption) {
        (true, Some(encryption)) => Some(encryption),
        (true, None) => {
            return Err(Error::Crypto {
                reason: "artifact is encrypted but no key is configured".to_string(),
            })
        }
        (false, _) => None,
    };

    let mut contents = BTreeMap::new();
    let mut mismatched = Vec::new();

    for entry in &header.entries {
        let Some((record, offset, length)) = entry.content() else {
            continue;
        };
        let start = offset as usize;
        let raw = &artifact.payload[start..start + length as usize];

        let bytes = match decode_content(raw, header.compressed, opener) {
            Ok(bytes) => bytes,
            Err(Error::Crypto { reason }) => return Err(Error::Crypto { reason }),
            Err(e) => {
                debug!("Entry {} failed to decode: {}", record.path.display(), e);
                mismatched.push(record.path.clone());
                continue;
            }
        };
        if bytes.len() as u64 != record.size || Fingerprint::of_bytes(&bytes) != record.fingerprint
        {
            mismatched.push(record.path.clone());
            continue;
        }
        contents.insert(record.path.clone(), bytes);
    }

    Ok(Inspection {
        unpacked: UnpackedArtifact {
            change_set: header.change_set(),
            header: header.clone(),
            contents,
        },
        mismatched,
    })
}

/// Exact inverse of [`pack`]; any fingerprint mismatch is an integrity error
pub fn unpack(artifact: &BackupArtifact, encryption: Option<&Encryption>) -> Result<UnpackedArtifact> {
    let inspection = inspect(artifact, encryption)?;
    if !inspection.mismatched.is_empty() {
        return Err(Error::integrity(
            "artifact content does not match its fingerprints",
            inspection.mismatched,
        ));
    }
    Ok(inspection.unpacked)
}

fn encode_content(bytes: Vec<u8>, compress: bool, sealer: Option<&Encryption>) -> Result<Vec<u8>> {
    let bytes = if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes)?;
        encoder.finish()?
    } else {
        bytes
    };
    match sealer {
        Some(sealer) => sealer.cipher.encrypt(&bytes, &sealer.key),
        None => Ok(bytes),
    }
}

fn decode_content(raw: &[u8], compressed: bool, opener: Option<&Encryption>) -> Result<Vec<u8>> {
    let bytes = match opener {
        Some(opener) => opener.cipher.decrypt(raw, &opener.key)?,
        None => raw.to_vec(),
    };
    if compressed {
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::diff;
    use crate::manifest::{BackupOptions, FileRecord};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn record(path: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            size: content.len() as u64,
            modified: Utc::now(),
            fingerprint: Fingerprint::of_bytes(content),
        }
    }

    fn fixture() -> (ChangeSet, BTreeMap<PathBuf, Vec<u8>>, Vec<FileRecord>) {
        let previous = vec![record("w/a.txt", &[1; 10]), record("w/b.txt", &[2; 20])];
        let current = vec![record("w/b.txt", &[3; 25]), record("w/c.txt", &[4; 300])];
        let mut source = BTreeMap::new();
        source.insert(PathBuf::from("w/b.txt"), vec![3; 25]);
        source.insert(PathBuf::from("w/c.txt"), vec![4; 300]);
        (diff(&previous, &current), source, current)
    }

    fn header(options: BackupOptions, files: Vec<FileRecord>, change_set: &ChangeSet) -> ManifestHeader {
        ManifestHeader {
            parent_version_id: None,
            created: Utc::now(),
            full_file_list: files,
            options,
            changes: change_set.counts(),
        }
    }

    #[cfg(feature = "encryption")]
    fn encryption(dir: &Path) -> Result<Encryption> {
        use crate::crypto::ChaChaCipher;
        Ok(Encryption {
            cipher: Arc::new(ChaChaCipher),
            key: ChaChaCipher::generate_key_file(dir.join("key"))?,
        })
    }

    #[cfg(feature = "encryption")]
    #[rstest]
    #[case(false, false)]
    #[case(true, false)]
    #[case(false, true)]
    #[case(true, true)]
    fn test_pack_unpack_roundtrip(#[case] compression: bool, #[case] encrypted: bool) -> Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let (change_set, source, files) = fixture();
        let options = BackupOptions {
            compression,
            encryption: encrypted,
            ..BackupOptions::default()
        };
        let key = if encrypted {
            Some(encryption(temp_dir.path())?)
        } else {
            None
        };

        let artifact = pack(&change_set, header(options, files, &change_set), &source, key.as_ref())?;
        let bytes = artifact.encode()?;
        if !encrypted && !compression {
            assert!(bytes.windows(25).any(|w| w == [3u8; 25]));
        }

        let decoded = BackupArtifact::decode(&bytes)?;
        let unpacked = unpack(&decoded, key.as_ref())?;
        assert_eq!(unpacked.change_set, change_set);
        assert_eq!(unpacked.contents, source);

        // The header stays readable without the key
        assert_eq!(read_header(&bytes)?, artifact.header);
        if encrypted {
            assert!(matches!(unpack(&decoded, None), Err(Error::Crypto { .. })));
        }
        Ok(())
    }

    #[test]
    fn test_file_changed_during_pack() {
        let (change_set, mut source, files) = fixture();
        source.insert(PathBuf::from("w/c.txt"), vec![9; 300]);

        let result = pack(
            &change_set,
            header(BackupOptions::default(), files, &change_set),
            &source,
            None,
        );
        match result {
            Err(Error::Integrity { paths, .. }) => assert_eq!(paths, vec![PathBuf::from("w/c.txt")]),
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupted_payload_is_rejected() -> Result<()> {
        let (change_set, source, files) = fixture();
        let artifact = pack(
            &change_set,
            header(BackupOptions::default(), files, &change_set),
            &source,
            None,
        )?;

        let mut corrupted = artifact.clone();
        let last = corrupted.payload.len() - 1;
        corrupted.payload[last] ^= 0x01;

        // Modified entries follow added ones, so the last byte belongs to b.txt
        let inspection = inspect(&corrupted, None)?;
        assert_eq!(inspection.mismatched, vec![PathBuf::from("w/b.txt")]);
        assert!(inspection.unpacked.contents.contains_key(Path::new("w/c.txt")));
        assert!(matches!(unpack(&corrupted, None), Err(Error::Integrity { .. })));
        Ok(())
    }

    #[test]
    fn test_malformed_artifacts() -> Result<()> {
        let (change_set, source, files) = fixture();
        let bytes = pack(
            &change_set,
            header(BackupOptions::default(), files, &change_set),
            &source,
            None,
        )?
        .encode()?;

        assert!(matches!(BackupArtifact::decode(b"nonsense"), Err(Error::Integrity { .. })));
        assert!(matches!(
            BackupArtifact::decode(&bytes[..bytes.len() - 10]),
            Err(Error::Integrity { .. })
        ));
        assert!(matches!(BackupArtifact::decode(&bytes[..20]), Err(Error::Integrity { .. })));
        Ok(())
    }

    #[test]
    fn test_unsafe_paths_are_rejected() -> Result<()> {
        let evil = record("../outside.txt", b"x");
        let change_set = ChangeSet {
            added: vec![evil.clone()],
            ..ChangeSet::default()
        };
        let mut source = BTreeMap::new();
        source.insert(evil.path.clone(), b"x".to_vec());

        let bytes = pack(
            &change_set,
            header(BackupOptions::default(), vec![evil], &change_set),
            &source,
            None,
        )?
        .encode()?;
        assert!(matches!(BackupArtifact::decode(&bytes), Err(Error::Integrity { .. })));
        Ok(())
    }

    #[test]
    fn test_file_removed_after_scan_is_left_out() -> Result<()> {
        use crate::scanner::{scan, ScanOptions, WatchedRoot};

        let temp_dir = tempfile::TempDir::new()?;
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&docs)?;
        fs::write(docs.join("a.txt"), b"alpha")?;
        fs::write(docs.join("b.txt"), b"bravo")?;

        let snapshot = scan(&[WatchedRoot::directory(&docs)?], &ScanOptions::default(), &[])?;
        let change_set = diff(&[], &snapshot.records);
        fs::remove_file(docs.join("b.txt"))?;

        let artifact = pack(
            &change_set,
            header(BackupOptions::default(), snapshot.records.clone(), &change_set),
            &snapshot,
            None,
        )?;
        let manifest = &artifact.header.manifest;
        assert_eq!(manifest.full_file_list.len(), 1);
        assert_eq!(manifest.full_file_list[0].path, PathBuf::from("docs/a.txt"));
        assert_eq!(manifest.changes.added, 1);
        assert_eq!(
            artifact.header.change_set().apply(&[])?,
            manifest.full_file_list
        );
        Ok(())
    }

    struct Vanishing {
        inner: BTreeMap<PathBuf, Vec<u8>>,
        gone: PathBuf,
    }

    impl ContentSource for Vanishing {
        fn read(&self, record: &FileRecord) -> Result<Vec<u8>> {
            if record.path == self.gone {
                return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied).into());
            }
            self.inner.read(record)
        }
    }

    #[test]
    fn test_unreadable_modified_file_keeps_previous_record() -> Result<()> {
        let previous = vec![record("w/a.txt", &[1; 10]), record("w/b.txt", &[2; 20])];
        let current = vec![record("w/b.txt", &[3; 25]), record("w/c.txt", &[4; 300])];
        let change_set = diff(&previous, &current);
        let source = Vanishing {
            inner: BTreeMap::from([(PathBuf::from("w/c.txt"), vec![4; 300])]),
            gone: PathBuf::from("w/b.txt"),
        };

        let artifact = pack(
            &change_set,
            header(BackupOptions::default(), current.clone(), &change_set),
            &source,
            None,
        )?;
        let manifest = &artifact.header.manifest;
        assert_eq!(manifest.full_file_list, vec![previous[1].clone(), current[1].clone()]);
        assert_eq!(manifest.changes.modified, 0);
        assert_eq!(manifest.changes.deleted, 1);

        let unpacked = unpack(&artifact, None)?;
        assert_eq!(unpacked.change_set.apply(&previous)?, manifest.full_file_list);
        Ok(())
    }

    #[test]
    fn test_encryption_requires_a_key() -> Result<()> {
        let (change_set, source, files) = fixture();
        let options = BackupOptions {
            encryption: true,
            ..BackupOptions::default()
        };
        let result = pack(&change_set, header(options, files, &change_set), &source, None);
        assert!(matches!(result, Err(Error::Configuration { .. })));
        Ok(())
    }
}
