//! Directory analyzer: walk a basedir, fingerprint what the filters accept,
//! and diff the result against the coverage baseline.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DriftError, Result};
use crate::drift::changeset::{
    Category, ChangeType, DirectoryEntry, FileEntry, join_relative, split_relative,
};
use crate::scanner::digest::{Digest, digest_file};
use crate::scanner::filter::FilterSet;
use crate::scanner::walker::{DirectoryWalker, SkipReason, WalkEvent, WalkerConfig};

// ──────────────────── snapshot ────────────────────

/// Relative path → digest, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    files: BTreeMap<String, Digest>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relative: impl Into<String>, digest: Digest) -> Option<Digest> {
        self.files.insert(relative.into(), digest)
    }

    pub fn remove(&mut self, relative: &str) -> Option<Digest> {
        self.files.remove(relative)
    }

    pub fn get(&self, relative: &str) -> Option<&Digest> {
        self.files.get(relative)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Digest)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build a baseline from the entries of a COVERAGE change-set, which must
    /// all be ADDED.
    pub fn from_coverage<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a DirectoryEntry>,
    {
        let mut snapshot = Self::new();
        for dir in entries {
            for file in &dir.files {
                match (file.change_type, &file.new_digest) {
                    (ChangeType::Added, Some(digest)) => {
                        snapshot.insert(dir.file_path(&file.file_name), digest.clone());
                    }
                    _ => {
                        return Err(DriftError::InvalidChangeSet {
                            details: format!(
                                "coverage entry {:?} is not ADDED",
                                dir.file_path(&file.file_name)
                            ),
                        });
                    }
                }
            }
        }
        Ok(snapshot)
    }

    /// Fold one change-set's entries into this snapshot.
    pub fn apply<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = &'a DirectoryEntry>,
    {
        for dir in entries {
            for file in &dir.files {
                let path = dir.file_path(&file.file_name);
                match file.current_digest() {
                    Some(digest) => {
                        self.files.insert(path, digest.clone());
                    }
                    None => {
                        self.files.remove(&path);
                    }
                }
            }
        }
    }

    /// Every file as an ADDED entry, grouped by directory.
    pub fn to_directory_entries(&self) -> Vec<DirectoryEntry> {
        let added = self.files.iter().map(|(path, digest)| {
            let (directory, name) = split_relative(path);
            FileDiff {
                directory: directory.to_string(),
                entry: FileEntry::added(name, digest.clone()),
            }
        });
        group_by_directory(added)
    }
}

impl FromIterator<(String, Digest)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (String, Digest)>>(iter: T) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

// ──────────────────── diff ────────────────────

/// One file-level change and the directory it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub directory: String,
    pub entry: FileEntry,
}

impl FileDiff {
    pub fn relative_path(&self) -> String {
        join_relative(&self.directory, &self.entry.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub category: Category,
    pub added: Vec<FileDiff>,
    pub changed: Vec<FileDiff>,
    pub removed: Vec<FileDiff>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len()
    }

    /// Files whose current content must be shipped (ADDED and CHANGED).
    pub fn content_changes(&self) -> impl Iterator<Item = &FileDiff> {
        self.added.iter().chain(&self.changed)
    }

    /// Directory entries sorted by directory then file name; empty
    /// directories never appear.
    pub fn directory_entries(&self) -> Vec<DirectoryEntry> {
        group_by_directory(
            self.added
                .iter()
                .chain(&self.changed)
                .chain(&self.removed)
                .cloned(),
        )
    }
}

fn group_by_directory(diffs: impl Iterator<Item = FileDiff>) -> Vec<DirectoryEntry> {
    let mut grouped: BTreeMap<String, Vec<FileEntry>> = BTreeMap::new();
    for diff in diffs {
        grouped.entry(diff.directory).or_default().push(diff.entry);
    }
    grouped
        .into_iter()
        .filter(|(_, files)| !files.is_empty())
        .map(|(directory, mut files)| {
            files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
            DirectoryEntry { directory, files }
        })
        .collect()
}

/// Diff `current` against the coverage baseline. Without a baseline every
/// file is ADDED and the result is a COVERAGE change-set.
pub fn diff(current: &Snapshot, coverage: Option<&Snapshot>) -> DiffResult {
    let file_diff = |path: &str, entry: FileEntry| FileDiff {
        directory: split_relative(path).0.to_string(),
        entry,
    };
    let name_of = |path: &str| split_relative(path).1.to_string();

    let Some(coverage) = coverage else {
        return DiffResult {
            category: Category::Coverage,
            added: current
                .iter()
                .map(|(path, d)| file_diff(path, FileEntry::added(name_of(path), d.clone())))
                .collect(),
            changed: Vec::new(),
            removed: Vec::new(),
        };
    };

    let mut result = DiffResult {
        category: Category::Drift,
        added: Vec::new(),
        changed: Vec::new(),
        removed: Vec::new(),
    };
    for (path, digest) in current.iter() {
        match coverage.get(path) {
            None => result
                .added
                .push(file_diff(path, FileEntry::added(name_of(path), digest.clone()))),
            Some(old) if old != digest => result.changed.push(file_diff(
                path,
                FileEntry::changed(name_of(path), old.clone(), digest.clone()),
            )),
            Some(_) => {}
        }
    }
    for (path, old) in coverage.iter() {
        if current.get(path).is_none() {
            result
                .removed
                .push(file_diff(path, FileEntry::removed(name_of(path), old.clone())));
        }
    }
    result
}

// ──────────────────── analyzer ────────────────────

/// A file or directory left out of the snapshot, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Outcome of walking and hashing one basedir.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub snapshot: Snapshot,
    pub skipped: Vec<SkippedEntry>,
    pub filtered_out: usize,
    pub bytes_hashed: u64,
}

/// Snapshot plus its diff against the baseline.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub scan: ScanOutcome,
    pub diff: DiffResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerConfig {
    pub follow_symlinks: bool,
    pub max_depth: usize,
    pub parallelism: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            max_depth: 64,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryAnalyzer {
    config: AnalyzerConfig,
}

impl DirectoryAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Walk `basedir` and hash every regular file the filters accept.
    ///
    /// Hashing runs on `parallelism` threads fed straight from the walker's
    /// channel. A file that cannot be read is skipped, never fatal.
    pub fn snapshot(&self, basedir: &Path, filters: &FilterSet) -> Result<ScanOutcome> {
        let walker = DirectoryWalker::new(WalkerConfig {
            root: basedir.to_path_buf(),
            max_depth: self.config.max_depth,
            follow_symlinks: self.config.follow_symlinks,
            parallelism: self.config.parallelism,
        });
        let events = walker.stream()?;

        let partials: Vec<thread::Result<ScanOutcome>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.config.parallelism.max(1))
                .map(|_| {
                    let events = events.clone();
                    scope.spawn(move || hash_events(&events, filters))
                })
                .collect();
            handles.into_iter().map(|handle| handle.join()).collect()
        });
        let outcome = merge_partials(partials)?;

        for skipped in &outcome.skipped {
            tracing::warn!(
                path = %skipped.path.display(),
                reason = %skipped.reason,
                "excluded from snapshot"
            );
        }
        tracing::debug!(
            basedir = %basedir.display(),
            files = outcome.snapshot.len(),
            skipped = outcome.skipped.len(),
            filtered_out = outcome.filtered_out,
            bytes = outcome.bytes_hashed,
            "snapshot complete"
        );
        Ok(outcome)
    }

    /// Snapshot `basedir` and diff it against `coverage`.
    pub fn analyze(
        &self,
        basedir: &Path,
        filters: &FilterSet,
        coverage: Option<&Snapshot>,
    ) -> Result<Analysis> {
        let scan = self.snapshot(basedir, filters)?;
        let diff = diff(&scan.snapshot, coverage);
        Ok(Analysis { scan, diff })
    }
}

/// Combine the hashers' results. A hasher that panicked took an unknown
/// share of the tree with it, so the snapshot is incomplete.
fn merge_partials(partials: Vec<thread::Result<ScanOutcome>>) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();
    for part in partials {
        let part = part.map_err(|_| DriftError::Runtime {
            details: "hashing thread panicked; snapshot incomplete".to_string(),
        })?;
        outcome.snapshot.files.extend(part.snapshot.files);
        outcome.skipped.extend(part.skipped);
        outcome.filtered_out += part.filtered_out;
        outcome.bytes_hashed += part.bytes_hashed;
    }
    outcome.skipped.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(outcome)
}

fn hash_events(
    events: &crossbeam_channel::Receiver<WalkEvent>,
    filters: &FilterSet,
) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    for event in events {
        match event {
            WalkEvent::File(file) => {
                if file.relative.contains(['\n', '\r']) {
                    outcome.skipped.push(SkippedEntry {
                        path: file.path,
                        reason: SkipReason::UnencodableName,
                    });
                    continue;
                }
                if !filters.accepts(&file.relative) {
                    outcome.filtered_out += 1;
                    continue;
                }
                match digest_file(&file.path) {
                    Ok(digest) => {
                        outcome.bytes_hashed += file.size_bytes;
                        outcome.snapshot.insert(file.relative, digest);
                    }
                    Err(err) => outcome.skipped.push(SkippedEntry {
                        path: file.path,
                        reason: SkipReason::Unreadable(err.to_string()),
                    }),
                }
            }
            WalkEvent::Skipped { path, reason } => {
                outcome.skipped.push(SkippedEntry { path, reason });
            }
        }
    }
    outcome
}
