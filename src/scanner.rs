//! Tree scanning: one fingerprinted [`FileRecord`] per regular file under the
//! watched roots.
//!
//! Hashing runs on a bounded rayon pool. Results are merged by sorting on
//! path, so the snapshot does not depend on worker scheduling. A watched
//! root that is missing or cannot be opened fails the scan. Entries below it
//! that cannot be read are reported as warnings, and their previously
//! recorded state is carried forward so they are never mistaken for deletions.

use crate::fingerprint::Fingerprint;
use crate::manifest::FileRecord;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, span, warn, Level};
use walkdir::WalkDir;

/// Root name used for system configuration files
pub const SYSTEM_ROOT_NAME: &str = "system_config";

/// Critical system configuration files captured when system paths are included
pub const SYSTEM_PATHS: &[&str] = &[
    "/etc/fstab",
    "/etc/hosts",
    "/etc/passwd",
    "/etc/group",
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/etc/resolv.conf",
    "/etc/hostname",
    "/etc/network/interfaces",
    "/etc/apt/sources.list",
    "/etc/ssh/sshd_config",
    "/etc/ssh/ssh_config",
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/environment",
    "/etc/profile",
    "/etc/bash.bashrc",
];

/// Configuration for scanning
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Patterns to exclude (`*` wildcard, or an exact path segment)
    pub exclude_patterns: Vec<String>,
    /// Size of the hashing pool
    pub workers: usize,
    /// Reuse the previous fingerprint when size and mtime are unchanged
    pub trust_mtime: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            exclude_patterns: vec![".git".to_string(), "*.tmp".to_string()],
            workers: rayon::current_num_threads().clamp(1, 8),
            trust_mtime: true,
        }
    }
}

/// A directory (or fixed file list) being backed up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedRoot {
    /// First component of every record path under this root
    pub name: String,
    /// Absolute directory the relative paths resolve against
    pub base: PathBuf,
    /// Restrict the root to these files (relative to `base`) instead of walking it
    pub only: Option<Vec<PathBuf>>,
}

impl WatchedRoot {
    /// Root for a watched directory, named after its last component
    pub fn directory<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Configuration {
                reason: format!("Watched path has no usable name: {}", path.display()),
            })?;
        Ok(Self {
            name: name.to_string(),
            base: path.to_path_buf(),
            only: None,
        })
    }

    /// Root for the critical system configuration files
    pub fn system() -> Self {
        Self {
            name: SYSTEM_ROOT_NAME.to_string(),
            base: PathBuf::from("/"),
            only: Some(
                SYSTEM_PATHS
                    .iter()
                    .map(|p| PathBuf::from(p.trim_start_matches('/')))
                    .collect(),
            ),
        }
    }
}

/// Build the list of roots for a set of watched paths
pub fn roots_for(watched: &[PathBuf], include_system_paths: bool) -> Result<Vec<WatchedRoot>> {
    let mut roots = watched
        .iter()
        .map(WatchedRoot::directory)
        .collect::<Result<Vec<_>>>()?;
    if include_system_paths {
        roots.push(WatchedRoot::system());
    }

    let mut seen = HashSet::new();
    for root in &roots {
        if !seen.insert(root.name.as_str()) {
            return Err(Error::Configuration {
                reason: format!("Two watched roots are both named '{}'", root.name),
            });
        }
    }
    Ok(roots)
}

/// Why an entry was left out of the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Symlink,
    SpecialFile,
    Unreadable,
}

/// A non-fatal problem encountered while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub reason: SkipReason,
    pub message: String,
}

impl ScanWarning {
    fn unreadable(path: &Path, error: impl std::fmt::Display) -> Self {
        let err = Error::Scan {
            path: path.to_path_buf(),
            reason: error.to_string(),
        };
        warn!("{}", err);
        Self {
            path: path.to_path_buf(),
            reason: SkipReason::Unreadable,
            message: err.to_string(),
        }
    }

    fn skipped(path: &Path, reason: SkipReason) -> Self {
        debug!("Skipping {:?} entry: {}", reason, path.display());
        Self {
            path: path.to_path_buf(),
            reason,
            message: format!("{:?} skipped", reason),
        }
    }
}

/// The current state of the watched tree
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub roots: Vec<WatchedRoot>,
    /// Sorted by path
    pub records: Vec<FileRecord>,
    pub warnings: Vec<ScanWarning>,
}

impl TreeSnapshot {
    /// Resolve a record path back to the file on disk
    pub fn absolute_path(&self, record_path: &Path) -> Option<PathBuf> {
        resolve_record_path(&self.roots, record_path)
    }
}

/// Resolve a record path against a set of roots
pub fn resolve_record_path(roots: &[WatchedRoot], record_path: &Path) -> Option<PathBuf> {
    let mut components = record_path.components();
    let root_name = components.next()?.as_os_str().to_str()?;
    let root = roots.iter().find(|r| r.name == root_name)?;
    Some(root.base.join(components.as_path()))
}

/// A file found by the walk, not yet fingerprinted
struct Candidate {
    absolute: PathBuf,
    record_path: PathBuf,
}

/// Record paths (files or whole directories) that could not be read
#[derive(Debug, Default)]
struct Unreadable(Vec<PathBuf>);

impl Unreadable {
    fn push(&mut self, root: &WatchedRoot, absolute: &Path) {
        let relative = absolute.strip_prefix(&root.base).unwrap_or(Path::new(""));
        if let Some(path) = record_path(&root.name, relative) {
            self.0.push(path);
        }
    }

    fn covers(&self, path: &Path) -> bool {
        self.0.iter().any(|prefix| path.starts_with(prefix))
    }
}

/// Fail unless a walked root exists, is a directory and can be listed
fn check_root(root: &WatchedRoot) -> Result<()> {
    let scan_error = |reason: String| Error::Scan {
        path: root.base.clone(),
        reason,
    };
    let metadata = fs::metadata(&root.base)
        .map_err(|e| scan_error(format!("watched root cannot be opened: {}", e)))?;
    if !metadata.is_dir() {
        return Err(scan_error("watched root is not a directory".to_string()));
    }
    fs::read_dir(&root.base)
        .map_err(|e| scan_error(format!("watched root cannot be listed: {}", e)))?;
    Ok(())
}

/// Keep the previous record of every unreadable entry the scan did not produce
fn carry_forward(
    records: &mut Vec<FileRecord>,
    unreadable: &Unreadable,
    previous: &HashMap<&Path, &FileRecord>,
) -> usize {
    if unreadable.0.is_empty() {
        return 0;
    }
    let present: HashSet<PathBuf> = records.iter().map(|r| r.path.clone()).collect();
    let kept: Vec<FileRecord> = previous
        .iter()
        .filter(|(path, _)| unreadable.covers(path) && !present.contains(**path))
        .map(|(_, record)| (*record).clone())
        .collect();
    for record in &kept {
        debug!("Keeping previous state of unreadable {}", record.path.display());
    }
    let count = kept.len();
    records.extend(kept);
    count
}

/// Scan the roots, fingerprinting every regular file.
///
/// `previous` is the last recorded full file list; it only serves the mtime
/// pre-filter and never decides whether a file changed.
pub fn scan(
    roots: &[WatchedRoot],
    options: &ScanOptions,
    previous: &[FileRecord],
) -> Result<TreeSnapshot> {
    let span = span!(Level::INFO, "scan", roots = roots.len());
    let _enter = span.enter();

    let mut warnings = Vec::new();
    let mut candidates = Vec::new();
    let mut unreadable = Unreadable::default();

    for root in roots {
        if root.only.is_none() {
            check_root(root)?;
        }
    }
    for root in roots {
        match &root.only {
            Some(files) => {
                collect_listed(root, files, &mut candidates, &mut warnings, &mut unreadable)
            }
            None => collect_walked(root, options, &mut candidates, &mut warnings, &mut unreadable),
        }
    }

    let previous: HashMap<&Path, &FileRecord> =
        previous.iter().map(|r| (r.path.as_path(), r)).collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers.max(1))
        .build()
        .map_err(|e| Error::Configuration {
            reason: format!("Failed to build hashing pool: {}", e),
        })?;

    let results: Vec<std::result::Result<FileRecord, ScanWarning>> = pool.install(|| {
        candidates
            .par_iter()
            .map(|candidate| fingerprint_candidate(candidate, &previous, options.trust_mtime))
            .collect()
    });

    let mut records = Vec::with_capacity(results.len());
    for (candidate, result) in candidates.iter().zip(results) {
        match result {
            Ok(record) => records.push(record),
            Err(warning) => {
                unreadable.0.push(candidate.record_path.clone());
                warnings.push(warning);
            }
        }
    }

    let kept = carry_forward(&mut records, &unreadable, &previous);
    if kept > 0 {
        warn!("Kept the previous state of {} unreadable files", kept);
    }

    records.sort_by(|a, b| a.path.cmp(&b.path));
    warnings.sort_by(|a, b| a.path.cmp(&b.path));

    info!(
        "Scanned {} files ({} warnings)",
        records.len(),
        warnings.len()
    );

    Ok(TreeSnapshot {
        roots: roots.to_vec(),
        records,
        warnings,
    })
}

fn collect_walked(
    root: &WatchedRoot,
    options: &ScanOptions,
    candidates: &mut Vec<Candidate>,
    warnings: &mut Vec<ScanWarning>,
    unreadable: &mut Unreadable,
) {
    let walker = WalkDir::new(&root.base)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !should_exclude(&entry.file_name().to_string_lossy(), options)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(&root.base).to_path_buf();
                unreadable.push(root, &path);
                warnings.push(ScanWarning::unreadable(&path, e));
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            warnings.push(ScanWarning::skipped(entry.path(), SkipReason::Symlink));
            continue;
        }
        if !file_type.is_file() {
            warnings.push(ScanWarning::skipped(entry.path(), SkipReason::SpecialFile));
            continue;
        }

        let relative = match entry.path().strip_prefix(&root.base) {
            Ok(relative) => relative,
            Err(e) => {
                warnings.push(ScanWarning::unreadable(entry.path(), e));
                continue;
            }
        };
        match record_path(&root.name, relative) {
            Some(record_path) => candidates.push(Candidate {
                absolute: entry.path().to_path_buf(),
                record_path,
            }),
            None => warnings.push(ScanWarning::unreadable(entry.path(), "path is not valid UTF-8")),
        }
    }
}

fn collect_listed(
    root: &WatchedRoot,
    files: &[PathBuf],
    candidates: &mut Vec<Candidate>,
    warnings: &mut Vec<ScanWarning>,
    unreadable: &mut Unreadable,
) {
    for relative in files {
        let absolute = root.base.join(relative);
        let metadata = match fs::symlink_metadata(&absolute) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                unreadable.push(root, &absolute);
                warnings.push(ScanWarning::unreadable(&absolute, e));
                continue;
            }
        };

        if metadata.file_type().is_symlink() {
            warnings.push(ScanWarning::skipped(&absolute, SkipReason::Symlink));
        } else if !metadata.is_file() {
            warnings.push(ScanWarning::skipped(&absolute, SkipReason::SpecialFile));
        } else if let Some(record_path) = record_path(&root.name, relative) {
            candidates.push(Candidate {
                absolute,
                record_path,
            });
        }
    }
}

fn fingerprint_candidate(
    candidate: &Candidate,
    previous: &HashMap<&Path, &FileRecord>,
    trust_mtime: bool,
) -> std::result::Result<FileRecord, ScanWarning> {
    let metadata = fs::symlink_metadata(&candidate.absolute)
        .map_err(|e| ScanWarning::unreadable(&candidate.absolute, e))?;
    let size = metadata.len();
    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::from)
        .map_err(|e| ScanWarning::unreadable(&candidate.absolute, e))?;

    if trust_mtime {
        if let Some(prev) = previous.get(candidate.record_path.as_path()) {
            if prev.size == size && prev.modified == modified {
                return Ok((*prev).clone());
            }
        }
    }

    let fingerprint = Fingerprint::of_file(&candidate.absolute)
        .map_err(|e| ScanWarning::unreadable(&candidate.absolute, e))?;

    Ok(FileRecord {
        path: candidate.record_path.clone(),
        size,
        modified,
        fingerprint,
    })
}

/// Build `<root>/<a>/<b>` with `/` separators; `None` for non-UTF-8 names
fn record_path(root_name: &str, relative: &Path) -> Option<PathBuf> {
    let mut path = String::from(root_name);
    for component in relative.components() {
        path.push('/');
        path.push_str(component.as_os_str().to_str()?);
    }
    Some(PathBuf::from(path))
}

/// Check if a name should be excluded based on patterns
fn should_exclude(name: &str, options: &ScanOptions) -> bool {
    options
        .exclude_patterns
        .iter()
        .any(|pattern| matches_pattern(name, pattern))
}

/// Simple pattern matching (supports a single `*` wildcard)
fn matches_pattern(text: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some((prefix, suffix)) = pattern.split_once('*') {
        return text.len() >= prefix.len() + suffix.len()
            && text.starts_with(prefix)
            && text.ends_with(suffix);
    }

    text == pattern || path_contains_segment(text, pattern)
}

/// Check if a path contains a specific segment
fn path_contains_segment(path: &str, segment: &str) -> bool {
    path.split(['/', '\\']).any(|part| part == segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::TempDir;

    fn watched(temp_dir: &TempDir) -> Result<WatchedRoot> {
        let root = temp_dir.path().join("docs");
        fs::create_dir_all(&root)?;
        WatchedRoot::directory(root)
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("test.tmp", "*.tmp"));
        assert!(matches_pattern("/path/to/.git/file", ".git"));
        assert!(!matches_pattern("test.txt", "*.tmp"));
        assert!(!matches_pattern(".tmp", "x*.tmp"));
    }

    #[test]
    fn test_scan_records_sorted_relative_paths() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = watched(&temp_dir)?;
        fs::create_dir_all(root.base.join("sub"))?;
        fs::write(root.base.join("b.txt"), b"bbbb")?;
        fs::write(root.base.join("a.txt"), b"a")?;
        fs::write(root.base.join("sub").join("c.txt"), b"cc")?;

        let snapshot = scan(&[root], &ScanOptions::default(), &[])?;
        let paths: Vec<_> = snapshot.records.iter().map(|r| r.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("docs/a.txt"),
                PathBuf::from("docs/b.txt"),
                PathBuf::from("docs/sub/c.txt"),
            ]
        );
        assert_eq!(snapshot.records[1].size, 4);
        assert_eq!(snapshot.records[1].fingerprint, Fingerprint::of_bytes(b"bbbb"));
        assert!(snapshot.warnings.is_empty());

        let resolved = snapshot.absolute_path(Path::new("docs/sub/c.txt")).unwrap();
        assert_eq!(fs::read(resolved)?, b"cc");
        Ok(())
    }

    #[test]
    fn test_default_exclusions() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = watched(&temp_dir)?;
        fs::create_dir_all(root.base.join(".git"))?;
        fs::write(root.base.join(".git").join("HEAD"), b"ref")?;
        fs::write(root.base.join("draft.tmp"), b"scratch")?;
        fs::write(root.base.join("keep.txt"), b"keep")?;

        let snapshot = scan(&[root], &ScanOptions::default(), &[])?;
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].path, PathBuf::from("docs/keep.txt"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_warnings_not_records() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = watched(&temp_dir)?;
        fs::write(root.base.join("real.txt"), b"real")?;
        std::os::unix::fs::symlink(root.base.join("real.txt"), root.base.join("link.txt"))?;

        let snapshot = scan(&[root], &ScanOptions::default(), &[])?;
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.warnings.len(), 1);
        assert_eq!(snapshot.warnings[0].reason, SkipReason::Symlink);
        Ok(())
    }

    #[test]
    fn test_mtime_prefilter_reuses_fingerprint() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = watched(&temp_dir)?;
        fs::write(root.base.join("a.txt"), b"original")?;

        let first = scan(&[root.clone()], &ScanOptions::default(), &[])?;

        // A doctored previous fingerprint survives when size and mtime match
        let mut previous = first.records.clone();
        previous[0].fingerprint = Fingerprint::of_bytes(b"doctored");
        let second = scan(&[root.clone()], &ScanOptions::default(), &previous)?;
        assert_eq!(second.records[0].fingerprint, Fingerprint::of_bytes(b"doctored"));

        // ...but is recomputed when the pre-filter is disabled
        let options = ScanOptions {
            trust_mtime: false,
            ..ScanOptions::default()
        };
        let third = scan(&[root.clone()], &options, &previous)?;
        assert_eq!(third.records[0].fingerprint, Fingerprint::of_bytes(b"original"));

        // A content change with a new mtime is always rehashed
        sleep(Duration::from_millis(20));
        fs::write(root.base.join("a.txt"), b"changed!")?;
        let fourth = scan(&[root], &ScanOptions::default(), &previous)?;
        assert_eq!(fourth.records[0].fingerprint, Fingerprint::of_bytes(b"changed!"));
        Ok(())
    }

    #[test]
    fn test_duplicate_root_names_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let a = temp_dir.path().join("one").join("docs");
        let b = temp_dir.path().join("two").join("docs");
        let result = roots_for(&[a, b], false);
        assert!(matches!(result, Err(Error::Configuration { .. })));
        Ok(())
    }

    #[test]
    fn test_missing_or_invalid_root_fails_the_scan() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let missing = WatchedRoot::directory(temp_dir.path().join("gone"))?;
        let result = scan(&[missing], &ScanOptions::default(), &[]);
        assert!(matches!(result, Err(Error::Scan { .. })));

        let file = temp_dir.path().join("plain");
        fs::write(&file, b"not a directory")?;
        let result = scan(&[WatchedRoot::directory(&file)?], &ScanOptions::default(), &[]);
        assert!(matches!(result, Err(Error::Scan { .. })));
        Ok(())
    }

    #[test]
    fn test_unreadable_entries_keep_previous_records() {
        let record = |path: &str| FileRecord {
            path: PathBuf::from(path),
            size: 1,
            modified: Utc::now(),
            fingerprint: Fingerprint::of_bytes(path.as_bytes()),
        };
        let previous = vec![
            record("docs/a.txt"),
            record("docs/locked/b.txt"),
            record("docs/locked/deep/c.txt"),
            record("docs/d.txt"),
        ];
        let previous_map: HashMap<&Path, &FileRecord> =
            previous.iter().map(|r| (r.path.as_path(), r)).collect();

        // a.txt scanned fine, the locked directory and d.txt could not be read
        let mut records = vec![previous[0].clone()];
        let unreadable = Unreadable(vec![PathBuf::from("docs/locked"), PathBuf::from("docs/d.txt")]);
        let kept = carry_forward(&mut records, &unreadable, &previous_map);
        records.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(kept, 3);
        assert_eq!(records, previous);
    }

    #[test]
    fn test_unreadable_prefix_is_component_wise() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = watched(&temp_dir)?;
        let mut unreadable = Unreadable::default();
        unreadable.push(&root, &root.base.join("locked"));
        assert!(unreadable.covers(Path::new("docs/locked/b.txt")));
        assert!(!unreadable.covers(Path::new("docs/locked-not/b.txt")));

        // An error on the root itself covers everything under it
        unreadable.push(&root, &root.base);
        assert!(unreadable.covers(Path::new("docs/other.txt")));
        Ok(())
    }

    #[test]
    fn test_system_root_resolves_absolute() {
        let roots = vec![WatchedRoot::system()];
        assert_eq!(
            resolve_record_path(&roots, Path::new("system_config/etc/hosts")),
            Some(PathBuf::from("/etc/hosts"))
        );
    }
}
