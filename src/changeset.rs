//! Change sets: the delta between two tree states

use crate::manifest::{ChangeCounts, FileRecord};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The computed delta between two tree states. Each list is sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<FileRecord>,
    /// (old, new) pairs
    pub modified: Vec<(FileRecord, FileRecord)>,
    pub deleted: Vec<PathBuf>,
}

impl ChangeSet {
    /// A change set that adds every file, i.e. a full backup
    pub fn full(current: &[FileRecord]) -> Self {
        let mut change_set = Self {
            added: current.to_vec(),
            ..Self::default()
        };
        change_set.sort();
        change_set
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Number of entries of each kind
    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.added.len(),
            modified: self.modified.len(),
            deleted: self.deleted.len(),
        }
    }

    /// Records whose content has to be shipped (added and new side of modified)
    pub fn content_records(&self) -> impl Iterator<Item = &FileRecord> {
        self.added
            .iter()
            .chain(self.modified.iter().map(|(_, new)| new))
    }

    /// Sort every list by path so equal change sets compare equal
    pub fn sort(&mut self) {
        self.added.sort_by(|a, b| a.path.cmp(&b.path));
        self.modified.sort_by(|a, b| a.1.path.cmp(&b.1.path));
        self.deleted.sort();
    }

    /// Replay this change set onto a previous full file list.
    ///
    /// The replay is strict: adding an existing path, or modifying or
    /// deleting a missing one, means the change set does not belong on top
    /// of `previous` and is reported as an integrity failure.
    pub fn apply(&self, previous: &[FileRecord]) -> Result<Vec<FileRecord>> {
        let mut tree: BTreeMap<&Path, &FileRecord> =
            previous.iter().map(|r| (r.path.as_path(), r)).collect();
        let mut conflicts = Vec::new();

        for path in &self.deleted {
            if tree.remove(path.as_path()).is_none() {
                conflicts.push(path.clone());
            }
        }
        for (old, new) in &self.modified {
            match tree.get(old.path.as_path()) {
                Some(existing) if existing.path == new.path => {
                    tree.insert(new.path.as_path(), new);
                }
                _ => conflicts.push(new.path.clone()),
            }
        }
        for record in &self.added {
            if tree.insert(record.path.as_path(), record).is_some() {
                conflicts.push(record.path.clone());
            }
        }

        if !conflicts.is_empty() {
            return Err(Error::integrity(
                "change set does not apply to the parent file list",
                conflicts,
            ));
        }
        Ok(tree.into_values().cloned().collect())
    }
}

/// Compare a previous full file list against the current snapshot.
///
/// Paths only in `current` are added, paths only in `previous` are deleted,
/// and paths in both whose content differs are modified.
pub fn diff(previous: &[FileRecord], current: &[FileRecord]) -> ChangeSet {
    let previous: BTreeMap<&Path, &FileRecord> =
        previous.iter().map(|r| (r.path.as_path(), r)).collect();
    let current_map: BTreeMap<&Path, &FileRecord> =
        current.iter().map(|r| (r.path.as_path(), r)).collect();

    let mut change_set = ChangeSet::default();

    for (path, record) in &current_map {
        match previous.get(path) {
            None => change_set.added.push((*record).clone()),
            Some(old) if !old.same_content(record) => {
                change_set.modified.push(((*old).clone(), (*record).clone()))
            }
            Some(_) => {}
        }
    }

    for path in previous.keys() {
        if !current_map.contains_key(path) {
            change_set.deleted.push(path.to_path_buf());
        }
    }

    change_set.sort();
    change_set
}

/// Replay a sequence of change sets onto an empty tree
pub fn replay<'a, I>(change_sets: I) -> Result<Vec<FileRecord>>
where
    I: IntoIterator<Item = &'a ChangeSet>,
{
    change_sets
        .into_iter()
        .try_fold(Vec::new(), |tree, change_set| change_set.apply(&tree))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn record(path: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            size: content.len() as u64,
            modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            fingerprint: Fingerprint::of_bytes(content),
        }
    }

    #[test]
    fn test_empty_previous_is_full_backup() {
        let current = vec![record("w/a.txt", b"a"), record("w/b.txt", b"b")];
        let change_set = diff(&[], &current);

        assert_eq!(change_set, ChangeSet::full(&current));
        assert_eq!(change_set.counts().added, 2);
    }

    #[test]
    fn test_added_modified_deleted() {
        let previous = vec![record("w/a.txt", &[1; 10]), record("w/b.txt", &[2; 20])];
        let current = vec![record("w/b.txt", &[3; 25]), record("w/c.txt", b"c")];

        let change_set = diff(&previous, &current);
        assert_eq!(change_set.added, vec![record("w/c.txt", b"c")]);
        assert_eq!(change_set.modified.len(), 1);
        assert_eq!(change_set.modified[0].0, previous[1]);
        assert_eq!(change_set.modified[0].1, current[0]);
        assert_eq!(change_set.deleted, vec![PathBuf::from("w/a.txt")]);

        assert_eq!(change_set.apply(&previous).unwrap(), current);
    }

    #[test]
    fn test_mtime_only_change_is_not_a_modification() {
        let previous = vec![record("w/a.txt", b"same")];
        let mut touched = record("w/a.txt", b"same");
        touched.modified = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        assert!(diff(&previous, &[touched]).is_empty());
    }

    #[test]
    fn test_file_becoming_directory_is_delete_then_add() {
        let previous = vec![record("w/node", b"file")];
        let current = vec![record("w/node/inner.txt", b"child")];

        let change_set = diff(&previous, &current);
        assert!(change_set.modified.is_empty());
        assert_eq!(change_set.deleted, vec![PathBuf::from("w/node")]);
        assert_eq!(change_set.added, current);
    }

    #[test]
    fn test_strict_apply_rejects_foreign_change_set() {
        let change_set = ChangeSet {
            deleted: vec![PathBuf::from("w/missing.txt")],
            ..ChangeSet::default()
        };
        let result = change_set.apply(&[record("w/a.txt", b"a")]);
        assert!(matches!(result, Err(Error::Integrity { .. })));
    }

    #[test]
    fn test_replay_reproduces_each_state() {
        let v1 = vec![record("w/a.txt", b"a"), record("w/b.txt", b"b")];
        let v2 = vec![record("w/b.txt", b"b2"), record("w/c.txt", b"c")];
        let v3 = vec![record("w/c.txt", b"c"), record("w/d.txt", b"d")];

        let c1 = diff(&[], &v1);
        let c2 = diff(&v1, &v2);
        let c3 = diff(&v2, &v3);

        assert_eq!(replay([&c1]).unwrap(), v1);
        assert_eq!(replay([&c1, &c2]).unwrap(), v2);
        assert_eq!(replay([&c1, &c2, &c3]).unwrap(), v3);
    }
}
