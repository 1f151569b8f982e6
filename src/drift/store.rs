//! On-disk change-set store.
//!
//! ```text
//! <data_dir>/<resourceId>/<encodedDefinitionName>/
//!     changeset.txt              most recent change-set
//!     changeset.txt.previous     the one before it, until acknowledged
//!     snapshot.txt               accumulated coverage baseline
//!     content/<digest>           content blobs awaiting a content bundle ack
//!     changeset_<epochMillis>.zip
//!     content_<token>.zip
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! reader never observes a partial change-set, blob or bundle. Each schedule
//! owns its directory exclusively; the store itself holds no locks.

#![allow(missing_docs)]

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::core::errors::{DriftError, Result};
use crate::drift::changeset::{Category, DirectoryEntry, Header};
use crate::drift::codec::{ChangeSetReader, write_change_set_file};
use crate::drift::definition::{ResourceId, ScheduleKey};
use crate::scanner::analyzer::Snapshot;
use crate::scanner::digest::{Digest, HashingReader};

pub const CHANGE_SET_FILE: &str = "changeset.txt";
pub const PREVIOUS_FILE: &str = "changeset.txt.previous";
pub const COVERAGE_FILE: &str = "snapshot.txt";
pub const CONTENT_DIR: &str = "content";
const CHANGE_SET_BUNDLE_PREFIX: &str = "changeset_";
const CONTENT_BUNDLE_PREFIX: &str = "content_";
const BUNDLE_SUFFIX: &str = ".zip";
const TMP_SUFFIX: &str = ".tmp";
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Accumulated baseline: the latest change-set version and the file set it
/// describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub version: u32,
    pub basedir_path: String,
    pub snapshot: Snapshot,
}

/// Result of storing one content blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentOutcome {
    Stored { bytes: u64 },
    AlreadyPresent,
    /// The file changed between hashing and copying; nothing was stored.
    Mismatch { actual: Digest },
}

/// A pending bundle on disk. `token` is the epoch-millis stamp for
/// change-set bundles and the acknowledgement token for content bundles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBundle {
    pub path: PathBuf,
    pub token: String,
    pub created_millis: i64,
}

#[derive(Debug, Clone)]
pub struct ChangeSetStore {
    data_dir: PathBuf,
}

impl ChangeSetStore {
    /// Open (creating if needed) a store rooted at `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| DriftError::io(&data_dir, e))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ──────────────────── layout ────────────────────

    pub fn definition_dir(&self, key: &ScheduleKey) -> PathBuf {
        self.data_dir
            .join(key.resource_id.to_string())
            .join(encode_name(&key.definition_name))
    }

    pub fn change_set_path(&self, key: &ScheduleKey) -> PathBuf {
        self.definition_dir(key).join(CHANGE_SET_FILE)
    }

    pub fn previous_path(&self, key: &ScheduleKey) -> PathBuf {
        self.definition_dir(key).join(PREVIOUS_FILE)
    }

    pub fn coverage_path(&self, key: &ScheduleKey) -> PathBuf {
        self.definition_dir(key).join(COVERAGE_FILE)
    }

    pub fn content_dir(&self, key: &ScheduleKey) -> PathBuf {
        self.definition_dir(key).join(CONTENT_DIR)
    }

    pub fn content_path(&self, key: &ScheduleKey, digest: &Digest) -> PathBuf {
        self.content_dir(key).join(digest.as_str())
    }

    pub fn content_bundle_path(&self, key: &ScheduleKey, token: &str) -> PathBuf {
        self.definition_dir(key)
            .join(format!("{CONTENT_BUNDLE_PREFIX}{token}{BUNDLE_SUFFIX}"))
    }

    /// A fresh `changeset_<epochMillis>.zip` path. The stamp is bumped past
    /// any existing bundle so names stay unique and ordered.
    pub fn new_change_set_bundle_path(&self, key: &ScheduleKey) -> Result<PathBuf> {
        let latest = self
            .pending_change_set_bundles(key)?
            .last()
            .map_or(i64::MIN, |b| b.created_millis);
        let millis = chrono::Utc::now().timestamp_millis().max(latest.saturating_add(1));
        Ok(self
            .definition_dir(key)
            .join(format!("{CHANGE_SET_BUNDLE_PREFIX}{millis}{BUNDLE_SUFFIX}")))
    }

    /// A fresh content-bundle token: `<epochMillis>-<random hex>`.
    pub fn new_content_token(&self) -> String {
        let suffix: u32 = rand::rng().random();
        format!("{}-{suffix:08x}", chrono::Utc::now().timestamp_millis())
    }

    // ──────────────────── change-sets ────────────────────

    /// Whether a scan ever completed for this definition.
    pub fn has_change_set(&self, key: &ScheduleKey) -> bool {
        self.change_set_path(key).is_file()
    }

    /// Reader over the most recent change-set, or `None` when no scan has
    /// completed yet.
    pub fn get_reader(
        &self,
        key: &ScheduleKey,
    ) -> Result<Option<ChangeSetReader<BufReader<File>>>> {
        open_reader(&self.change_set_path(key))
    }

    /// Reader over the previous change-set, if one is retained.
    pub fn get_previous_reader(
        &self,
        key: &ScheduleKey,
    ) -> Result<Option<ChangeSetReader<BufReader<File>>>> {
        open_reader(&self.previous_path(key))
    }

    /// Load the coverage baseline. `None` means no baseline exists and the
    /// next change-set must be a COVERAGE one. A baseline that fails to decode
    /// is an error; callers quarantine it rather than diff against it.
    pub fn read_coverage(&self, key: &ScheduleKey) -> Result<Option<Coverage>> {
        let Some(reader) = open_reader(&self.coverage_path(key))? else {
            return Ok(None);
        };
        let header = reader.header().clone();
        if header.category != Category::Coverage {
            return Err(DriftError::InvalidChangeSet {
                details: format!("baseline for {key} is not a coverage change-set"),
            });
        }
        let entries = reader.collect::<Result<Vec<_>>>()?;
        Ok(Some(Coverage {
            version: header.version,
            basedir_path: header.basedir_path,
            snapshot: Snapshot::from_coverage(&entries)?,
        }))
    }

    /// Persist a new change-set and fold it into the baseline.
    ///
    /// Sequence: write `changeset.txt.tmp` and `snapshot.txt.tmp`; then rename
    /// the current change-set to `.previous` and both temp files into place.
    /// Nothing is renamed unless both temp files were written, so the current
    /// change-set and the baseline always carry the same version.
    /// A DRIFT change-set requires an existing baseline.
    pub fn write(
        &self,
        key: &ScheduleKey,
        header: &Header,
        entries: &[DirectoryEntry],
    ) -> Result<PathBuf> {
        let mut snapshot = match header.category {
            Category::Coverage => Snapshot::new(),
            Category::Drift => {
                self.read_coverage(key)?
                    .ok_or_else(|| DriftError::InvalidChangeSet {
                        details: format!("drift change-set for {key} has no coverage baseline"),
                    })?
                    .snapshot
            }
        };
        snapshot.apply(entries);

        let dir = self.definition_dir(key);
        fs::create_dir_all(&dir).map_err(|e| DriftError::io(&dir, e))?;

        let current = self.change_set_path(key);
        let tmp = tmp_path(&current);
        let coverage_header = Header {
            definition_name: header.definition_name.clone(),
            basedir_path: header.basedir_path.clone(),
            category: Category::Coverage,
            version: header.version,
        };
        let coverage = self.coverage_path(key);
        let coverage_tmp = tmp_path(&coverage);

        let staged = write_change_set_file(&tmp, header, entries).and_then(|()| {
            write_change_set_file(&coverage_tmp, &coverage_header, &snapshot.to_directory_entries())
        });
        if let Err(err) = staged {
            let _ = fs::remove_file(&tmp);
            let _ = fs::remove_file(&coverage_tmp);
            return Err(err);
        }

        if current.exists() {
            let previous = self.previous_path(key);
            fs::rename(&current, &previous).map_err(|e| DriftError::io(&previous, e))?;
        }
        fs::rename(&tmp, &current).map_err(|e| DriftError::io(&current, e))?;
        fs::rename(&coverage_tmp, &coverage).map_err(|e| DriftError::io(&coverage, e))?;

        Ok(current)
    }

    /// Move an undecodable baseline aside as `snapshot.txt.corrupt`.
    pub fn quarantine_coverage(&self, key: &ScheduleKey) -> Result<Option<PathBuf>> {
        let coverage = self.coverage_path(key);
        let target = coverage.with_file_name(format!("{COVERAGE_FILE}{CORRUPT_SUFFIX}"));
        match fs::rename(&coverage, &target) {
            Ok(()) => Ok(Some(target)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DriftError::io(&coverage, err)),
        }
    }

    // ──────────────────── content ────────────────────

    /// Store an in-memory blob under its digest.
    pub fn store_content(&self, key: &ScheduleKey, digest: &Digest, bytes: &[u8]) -> Result<bool> {
        let target = self.content_path(key, digest);
        if target.is_file() {
            return Ok(false);
        }
        let dir = self.content_dir(key);
        fs::create_dir_all(&dir).map_err(|e| DriftError::io(&dir, e))?;
        let tmp = tmp_path(&target);
        fs::write(&tmp, bytes).map_err(|e| DriftError::io(&tmp, e))?;
        fs::rename(&tmp, &target).map_err(|e| DriftError::io(&target, e))?;
        Ok(true)
    }

    /// Copy `source` into the content area under `expected`, re-hashing while
    /// copying. If the bytes no longer match the digest nothing is stored.
    pub fn store_content_file(
        &self,
        key: &ScheduleKey,
        expected: &Digest,
        source: &Path,
    ) -> Result<ContentOutcome> {
        let target = self.content_path(key, expected);
        if target.is_file() {
            return Ok(ContentOutcome::AlreadyPresent);
        }
        let dir = self.content_dir(key);
        fs::create_dir_all(&dir).map_err(|e| DriftError::io(&dir, e))?;

        let input = File::open(source).map_err(|e| DriftError::io(source, e))?;
        let tmp = tmp_path(&target);
        let mut out = File::create(&tmp).map_err(|e| DriftError::io(&tmp, e))?;
        let mut reader = HashingReader::new(input);
        let copied = io::copy(&mut reader, &mut out).and_then(|_| out.sync_all());
        if let Err(err) = copied {
            let _ = fs::remove_file(&tmp);
            return Err(DriftError::io(source, err));
        }
        let bytes = reader.bytes_read();
        let actual = reader.finish();
        if &actual != expected {
            let _ = fs::remove_file(&tmp);
            return Ok(ContentOutcome::Mismatch { actual });
        }
        fs::rename(&tmp, &target).map_err(|e| DriftError::io(&target, e))?;
        Ok(ContentOutcome::Stored { bytes })
    }

    pub fn has_content(&self, key: &ScheduleKey, digest: &Digest) -> bool {
        self.content_path(key, digest).is_file()
    }

    /// Digests of every stored blob, sorted.
    pub fn list_content(&self, key: &ScheduleKey) -> Result<Vec<Digest>> {
        let mut digests: Vec<Digest> = list_names(&self.content_dir(key))?
            .iter()
            .filter_map(|name| Digest::parse(name))
            .collect();
        digests.sort();
        Ok(digests)
    }

    /// Delete the given blobs; missing ones are ignored. Returns how many
    /// were removed.
    pub fn purge_content<'a, I>(&self, key: &ScheduleKey, digests: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a Digest>,
    {
        let mut removed = 0;
        for digest in digests {
            if remove_if_exists(&self.content_path(key, digest))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ──────────────────── bundles ────────────────────

    /// Change-set bundles on disk, oldest first.
    pub fn pending_change_set_bundles(&self, key: &ScheduleKey) -> Result<Vec<PendingBundle>> {
        self.pending_bundles(key, CHANGE_SET_BUNDLE_PREFIX)
    }

    /// Content bundles on disk, oldest first.
    pub fn pending_content_bundles(&self, key: &ScheduleKey) -> Result<Vec<PendingBundle>> {
        self.pending_bundles(key, CONTENT_BUNDLE_PREFIX)
    }

    fn pending_bundles(&self, key: &ScheduleKey, prefix: &str) -> Result<Vec<PendingBundle>> {
        let dir = self.definition_dir(key);
        let mut bundles: Vec<PendingBundle> = list_names(&dir)?
            .into_iter()
            .filter_map(|name| {
                let token = name.strip_prefix(prefix)?.strip_suffix(BUNDLE_SUFFIX)?;
                let millis = token.split('-').next()?.parse::<i64>().ok()?;
                Some(PendingBundle {
                    path: dir.join(&name),
                    token: token.to_string(),
                    created_millis: millis,
                })
            })
            .collect();
        bundles.sort_by(|a, b| {
            a.created_millis
                .cmp(&b.created_millis)
                .then_with(|| a.token.cmp(&b.token))
        });
        Ok(bundles)
    }

    // ──────────────────── purging ────────────────────

    /// Delete a definition's whole directory (unschedule).
    pub fn purge_directory(&self, key: &ScheduleKey) -> Result<bool> {
        let dir = self.definition_dir(key);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                // Drop the resource directory once its last definition is gone.
                if let Some(parent) = dir.parent() {
                    let _ = fs::remove_dir(parent);
                }
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(DriftError::io(&dir, err)),
        }
    }

    pub fn purge_previous(&self, key: &ScheduleKey) -> Result<bool> {
        remove_if_exists(&self.previous_path(key))
    }

    /// Delete every `changeset_*.zip`. Returns the number removed.
    pub fn purge_change_set_bundles(&self, key: &ScheduleKey) -> Result<usize> {
        let mut removed = 0;
        for bundle in self.pending_change_set_bundles(key)? {
            if remove_if_exists(&bundle.path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn purge_content_bundle(&self, key: &ScheduleKey, token: &str) -> Result<bool> {
        remove_if_exists(&self.content_bundle_path(key, token))
    }

    // ──────────────────── enumeration ────────────────────

    /// Every `(resourceId, definitionName)` with a directory in the store.
    pub fn definitions(&self) -> Result<Vec<ScheduleKey>> {
        let mut keys = Vec::new();
        for resource in list_names(&self.data_dir)? {
            let Ok(resource_id) = resource.parse::<ResourceId>() else {
                continue;
            };
            let resource_dir = self.data_dir.join(&resource);
            if !resource_dir.is_dir() {
                continue;
            }
            for encoded in list_names(&resource_dir)? {
                if !resource_dir.join(&encoded).is_dir() {
                    continue;
                }
                if let Some(name) = decode_name(&encoded) {
                    keys.push(ScheduleKey::new(resource_id, name));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn open_reader(path: &Path) -> Result<Option<ChangeSetReader<BufReader<File>>>> {
    match File::open(path) {
        Ok(file) => ChangeSetReader::new(BufReader::new(file)).map(Some),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(DriftError::io(path, err)),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(DriftError::io(path, err)),
    }
}

/// UTF-8 entry names of a directory; a missing directory is empty.
fn list_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(DriftError::io(dir, err)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DriftError::io(dir, e))?;
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    Ok(names)
}

/// Percent-encode a definition name into a single safe path component.
/// Only ASCII alphanumerics, `-` and `_` pass through.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

pub fn decode_name(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
