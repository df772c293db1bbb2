//! Incremental diff between a fresh walk and the persisted file records.
//!
//! [`diff_files`] is a pure function of its two inputs. Every walked path
//! lands in exactly one of added / changed / unchanged, and every persisted
//! record is either matched to a walked path or reported as deleted.
//!
//! Walk order is preserved in [`FileDiff::changes`] so the orchestrator
//! processes files in the order the walker produced them.

use std::collections::{HashMap, HashSet};

use crate::models::{FileRecord, WalkedFile};

/// Classification of one walked path.
#[derive(Debug, Clone, PartialEq)]
pub enum FileChange {
    /// Path has no persisted record.
    Added(WalkedFile),
    /// Persisted with a different digest.
    Changed {
        current: WalkedFile,
        previous: FileRecord,
    },
    /// Digest matches; all downstream work is skipped.
    Unchanged {
        current: WalkedFile,
        previous: FileRecord,
    },
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            FileChange::Added(current)
            | FileChange::Changed { current, .. }
            | FileChange::Unchanged { current, .. } => &current.path,
        }
    }

    pub fn needs_indexing(&self) -> bool {
        !matches!(self, FileChange::Unchanged { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileDiff {
    /// One entry per walked path, in walk order.
    pub changes: Vec<FileChange>,
    /// Persisted records whose path was not walked, sorted by path.
    pub deleted: Vec<FileRecord>,
}

impl FileDiff {
    pub fn added(&self) -> usize {
        self.count(|c| matches!(c, FileChange::Added(_)))
    }

    pub fn changed(&self) -> usize {
        self.count(|c| matches!(c, FileChange::Changed { .. }))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|c| matches!(c, FileChange::Unchanged { .. }))
    }

    pub fn deleted(&self) -> usize {
        self.deleted.len()
    }

    fn count(&self, pred: impl Fn(&FileChange) -> bool) -> usize {
        self.changes.iter().filter(|c| pred(c)).count()
    }
}

/// Classify `current` (the walk) against `previous` (persisted records).
///
/// A path walked twice is classified once, at its first position. A
/// persisted path that appears twice keeps its first record; the extras are
/// reported as deleted so they get cleaned up.
pub fn diff_files(current: Vec<WalkedFile>, previous: Vec<FileRecord>) -> FileDiff {
    let mut by_path: HashMap<String, FileRecord> = HashMap::with_capacity(previous.len());
    let mut deleted = Vec::new();

    for record in previous {
        if by_path.contains_key(&record.path) {
            deleted.push(record);
        } else {
            by_path.insert(record.path.clone(), record);
        }
    }

    let mut seen: HashSet<String> = HashSet::with_capacity(current.len());
    let mut changes = Vec::with_capacity(current.len());

    for file in current {
        if !seen.insert(file.path.clone()) {
            continue;
        }
        let change = match by_path.remove(&file.path) {
            None => FileChange::Added(file),
            Some(previous) if previous.content_hash == file.content_hash => {
                FileChange::Unchanged {
                    current: file,
                    previous,
                }
            }
            Some(previous) => FileChange::Changed {
                current: file,
                previous,
            },
        };
        changes.push(change);
    }

    deleted.extend(by_path.into_values());
    deleted.sort_by(|a, b| a.path.cmp(&b.path).then(a.id.cmp(&b.id)));

    FileDiff { changes, deleted }
}
