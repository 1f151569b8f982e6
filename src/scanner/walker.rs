//! Parallel directory walker for drift scans.
//!
//! Workers pull directories from a shared channel, list them, emit one
//! [`WalkEvent::File`] per regular file and queue subdirectories back onto the
//! channel. Anything that is not a regular file (symlinks when not following
//! them, sockets, fifos, devices) is reported as [`WalkEvent::Skipped`] so the
//! caller can log it; nothing is silently dropped. The work channel is
//! unbounded: losing a subtree would make its files look removed.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use parking_lot::Mutex;

use crate::core::errors::{DriftError, Result};

/// Walker configuration derived from `ScannerConfig`.
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    pub root: PathBuf,
    pub max_depth: usize,
    pub follow_symlinks: bool,
    pub parallelism: usize,
}

impl WalkerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_depth: 64,
            follow_symlinks: false,
            parallelism: 4,
        }
    }
}

/// A regular file discovered during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub path: PathBuf,
    /// Root-relative, `/`-separated.
    pub relative: String,
    pub size_bytes: u64,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Symlink,
    SpecialFile,
    NonUtf8Name,
    /// A line break in the name cannot be written to a change-set line.
    UnencodableName,
    Unreadable(String),
    DirectoryLoop,
    DepthLimit,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Symlink => f.write_str("symbolic link"),
            Self::SpecialFile => f.write_str("not a regular file"),
            Self::NonUtf8Name => f.write_str("name is not valid UTF-8"),
            Self::UnencodableName => f.write_str("name contains a line break"),
            Self::Unreadable(err) => write!(f, "unreadable: {err}"),
            Self::DirectoryLoop => f.write_str("directory already visited (symlink loop)"),
            Self::DepthLimit => f.write_str("below max_depth"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEvent {
    File(WalkEntry),
    Skipped { path: PathBuf, reason: SkipReason },
}

/// Item in the internal work queue: (directory_path, depth).
type WorkItem = (PathBuf, usize);

/// Parallel walker over one root.
pub struct DirectoryWalker {
    config: WalkerConfig,
}

impl DirectoryWalker {
    pub fn new(config: WalkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WalkerConfig {
        &self.config
    }

    /// Walk to completion and collect every event.
    pub fn walk(&self) -> Result<Vec<WalkEvent>> {
        Ok(self.stream()?.into_iter().collect())
    }

    /// Stream events as they are discovered. The walk runs on background
    /// threads; the receiver disconnects once every directory is processed.
    pub fn stream(&self) -> Result<channel::Receiver<WalkEvent>> {
        let root = &self.config.root;
        let meta = fs::metadata(root).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                DriftError::MissingBaseDirectory { path: root.clone() }
            } else {
                DriftError::io(root, err)
            }
        })?;
        if !meta.is_dir() {
            return Err(DriftError::MissingBaseDirectory { path: root.clone() });
        }

        let parallelism = self.config.parallelism.max(1);
        let (work_tx, work_rx) = channel::unbounded::<WorkItem>();
        let (result_tx, result_rx) = channel::unbounded::<WalkEvent>();
        let in_flight = Arc::new(AtomicUsize::new(1));
        let visited = Arc::new(Mutex::new(HashSet::new()));
        if self.config.follow_symlinks {
            visited.lock().insert(file_identity(&meta));
        }
        let _ = work_tx.send((root.clone(), 0));

        for _ in 0..parallelism {
            let work_rx = work_rx.clone();
            let work_tx = work_tx.clone();
            let result_tx = result_tx.clone();
            let in_flight = Arc::clone(&in_flight);
            let visited = Arc::clone(&visited);
            let config = self.config.clone();

            thread::spawn(move || {
                walker_thread(
                    &work_rx, &work_tx, &result_tx, &in_flight, &visited, &config,
                );
            });
        }

        Ok(result_rx)
    }
}

fn walker_thread(
    work_rx: &channel::Receiver<WorkItem>,
    work_tx: &channel::Sender<WorkItem>,
    result_tx: &channel::Sender<WalkEvent>,
    in_flight: &AtomicUsize,
    visited: &Mutex<HashSet<(u64, u64)>>,
    config: &WalkerConfig,
) {
    loop {
        match work_rx.recv_timeout(Duration::from_millis(50)) {
            Ok((dir_path, depth)) => {
                process_directory(
                    &dir_path, depth, work_tx, result_tx, in_flight, visited, config,
                );
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            Err(channel::RecvTimeoutError::Timeout) => {
                if in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
            }
            Err(channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// List one directory: emit files, queue subdirectories.
fn process_directory(
    dir_path: &Path,
    depth: usize,
    work_tx: &channel::Sender<WorkItem>,
    result_tx: &channel::Sender<WalkEvent>,
    in_flight: &AtomicUsize,
    visited: &Mutex<HashSet<(u64, u64)>>,
    config: &WalkerConfig,
) {
    let skip = |path: PathBuf, reason: SkipReason| {
        let _ = result_tx.send(WalkEvent::Skipped { path, reason });
    };

    let entries = match fs::read_dir(dir_path) {
        Ok(entries) => entries,
        Err(err) => {
            skip(dir_path.to_path_buf(), SkipReason::Unreadable(err.to_string()));
            return;
        }
    };

    for entry_result in entries {
        let entry = match entry_result {
            Ok(entry) => entry,
            Err(err) => {
                skip(dir_path.to_path_buf(), SkipReason::Unreadable(err.to_string()));
                continue;
            }
        };
        let child_path = entry.path();

        // file_type() comes from the directory entry and never follows links.
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(err) => {
                skip(child_path, SkipReason::Unreadable(err.to_string()));
                continue;
            }
        };

        let meta = if file_type.is_symlink() {
            if !config.follow_symlinks {
                skip(child_path, SkipReason::Symlink);
                continue;
            }
            match fs::metadata(&child_path) {
                Ok(meta) => meta,
                Err(err) => {
                    // Dangling link.
                    skip(child_path, SkipReason::Unreadable(err.to_string()));
                    continue;
                }
            }
        } else {
            match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    skip(child_path, SkipReason::Unreadable(err.to_string()));
                    continue;
                }
            }
        };

        if meta.is_dir() {
            if depth >= config.max_depth {
                skip(child_path, SkipReason::DepthLimit);
                continue;
            }
            if config.follow_symlinks && !visited.lock().insert(file_identity(&meta)) {
                skip(child_path, SkipReason::DirectoryLoop);
                continue;
            }
            in_flight.fetch_add(1, Ordering::AcqRel);
            if work_tx.send((child_path, depth + 1)).is_err() {
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            continue;
        }

        if !meta.is_file() {
            skip(child_path, SkipReason::SpecialFile);
            continue;
        }

        let Some(relative) = relative_path(&config.root, &child_path) else {
            skip(child_path, SkipReason::NonUtf8Name);
            continue;
        };
        let _ = result_tx.send(WalkEvent::File(WalkEntry {
            path: child_path,
            relative,
            size_bytes: meta.len(),
            depth,
        }));
    }
}

/// Root-relative `/`-separated path, or `None` when any component is not
/// valid UTF-8.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rest = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// `(device, inode)` of a directory, for loop detection.
fn file_identity(meta: &fs::Metadata) -> (u64, u64) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        (meta.dev(), meta.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        (0, 0)
    }
}
