//! Drift coordinator: turns stored change-sets into upload bundles, hands
//! them to the server, and deletes local artifacts only once the server
//! acknowledges them.
//!
//! Delivery is at-least-once. A bundle that was handed off stays on disk
//! until its acknowledgement; the in-memory handed-off set only prevents
//! re-sending within one process lifetime, so everything unacknowledged is
//! sent again after a restart.

#![allow(missing_docs)]

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::errors::{DriftError, Result};
use crate::drift::bundle::{BundleFile, entry_names, write_bundle};
use crate::drift::changeset::DirectoryEntry;
use crate::drift::definition::ScheduleKey;
use crate::drift::store::{CHANGE_SET_FILE, ChangeSetStore, PREVIOUS_FILE, PendingBundle};
use crate::drift::transport::DriftServer;
use crate::logger::journal::{ActivityEvent, JournalHandle};
use crate::scanner::digest::Digest;

/// What one flush accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub change_sets_sent: usize,
    pub content_sent: usize,
    /// Sends that failed (the bundles stay pending).
    pub failures: usize,
}

impl FlushReport {
    fn absorb(&mut self, other: &Self) {
        self.change_sets_sent += other.change_sets_sent;
        self.content_sent += other.content_sent;
        self.failures += other.failures;
    }
}

/// Bundles produced for one ready change-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyBundles {
    pub change_set_bundle: PathBuf,
    pub content_token: Option<String>,
    pub flush: FlushReport,
}

pub struct DriftCoordinator {
    store: ChangeSetStore,
    server: Arc<dyn DriftServer>,
    journal: JournalHandle,
    handed_off: Mutex<HashSet<PathBuf>>,
}

impl DriftCoordinator {
    pub fn new(store: ChangeSetStore, server: Arc<dyn DriftServer>, journal: JournalHandle) -> Self {
        Self {
            store,
            server,
            journal,
            handed_off: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &ChangeSetStore {
        &self.store
    }

    pub fn is_handed_off(&self, bundle: &Path) -> bool {
        self.handed_off.lock().contains(bundle)
    }

    /// A new change-set was just written for `key`: bundle it and its
    /// content, then send everything pending for the definition.
    pub fn change_set_ready(
        &self,
        key: &ScheduleKey,
        entries: &[DirectoryEntry],
    ) -> Result<ReadyBundles> {
        let change_set_bundle = self.bundle_change_set(key)?;
        let content_token = self.bundle_content(key, entries)?;
        let flush = self.flush_pending(key)?;
        Ok(ReadyBundles {
            change_set_bundle,
            content_token,
            flush,
        })
    }

    fn bundle_change_set(&self, key: &ScheduleKey) -> Result<PathBuf> {
        let current = self.store.change_set_path(key);
        if !current.is_file() {
            return Err(DriftError::InvalidChangeSet {
                details: format!("no change-set to bundle for {key}"),
            });
        }
        let mut files = vec![BundleFile::new(CHANGE_SET_FILE, current)];
        let previous = self.store.previous_path(key);
        if previous.is_file() {
            files.push(BundleFile::new(PREVIOUS_FILE, previous));
        }
        let path = self.store.new_change_set_bundle_path(key)?;
        let size = write_bundle(&path, &files)?;
        tracing::debug!(%key, bundle = %path.display(), bytes = size, "change-set bundled");
        Ok(path)
    }

    /// Zip the stored blobs referenced by ADDED and CHANGED entries. Blobs
    /// that were skipped at store time (file changed mid-scan) are absent and
    /// simply not shipped.
    fn bundle_content(&self, key: &ScheduleKey, entries: &[DirectoryEntry]) -> Result<Option<String>> {
        let digests: BTreeSet<&Digest> = entries
            .iter()
            .flat_map(|dir| dir.files.iter())
            .filter_map(|file| file.current_digest())
            .filter(|digest| self.store.has_content(key, digest))
            .collect();
        if digests.is_empty() {
            return Ok(None);
        }
        let files: Vec<BundleFile> = digests
            .iter()
            .map(|d| BundleFile::new(d.as_str(), self.store.content_path(key, d)))
            .collect();
        let token = self.store.new_content_token();
        let path = self.store.content_bundle_path(key, &token);
        let size = write_bundle(&path, &files)?;
        tracing::debug!(%key, %token, blobs = files.len(), bytes = size, "content bundled");
        Ok(Some(token))
    }

    /// Send every bundle of `key` not yet handed off in this process:
    /// change-set bundles oldest first, then content bundles. The first
    /// change-set failure stops the flush so later change-sets never overtake
    /// an earlier one.
    pub fn flush_pending(&self, key: &ScheduleKey) -> Result<FlushReport> {
        let mut report = FlushReport::default();

        for bundle in self.store.pending_change_set_bundles(key)? {
            if self.is_handed_off(&bundle.path) {
                continue;
            }
            let sent = self.send(key, &bundle, |size, stream| {
                self.server
                    .send_change_set_bundle(key.resource_id, size, stream)
            });
            if sent {
                report.change_sets_sent += 1;
            } else {
                report.failures += 1;
                return Ok(report);
            }
        }

        for bundle in self.store.pending_content_bundles(key)? {
            if self.is_handed_off(&bundle.path) {
                continue;
            }
            let sent = self.send(key, &bundle, |size, stream| {
                self.server.send_content_bundle(
                    key.resource_id,
                    &key.definition_name,
                    &bundle.token,
                    size,
                    stream,
                )
            });
            if sent {
                report.content_sent += 1;
            } else {
                report.failures += 1;
            }
        }
        Ok(report)
    }

    /// Flush every definition that has a directory in the store.
    pub fn flush_all(&self) -> Result<FlushReport> {
        let mut total = FlushReport::default();
        for key in self.store.definitions()? {
            match self.flush_pending(&key) {
                Ok(report) => total.absorb(&report),
                Err(err) => {
                    tracing::warn!(%key, error = %err, "flush failed");
                    total.failures += 1;
                }
            }
        }
        Ok(total)
    }

    fn send<F>(&self, key: &ScheduleKey, bundle: &PendingBundle, send: F) -> bool
    where
        F: FnOnce(u64, &mut dyn std::io::Read) -> Result<()>,
    {
        let outcome = File::open(&bundle.path)
            .and_then(|file| Ok((file.metadata()?.len(), file)))
            .map_err(|e| DriftError::io(&bundle.path, e))
            .and_then(|(size, mut file)| send(size, &mut file).map(|()| size));

        let is_content = bundle
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("content_"));
        match outcome {
            Ok(size) => {
                self.handed_off.lock().insert(bundle.path.clone());
                tracing::info!(%key, bundle = %bundle.path.display(), bytes = size, "bundle sent");
                self.journal.send(ActivityEvent::BundleSent {
                    resource_id: key.resource_id,
                    definition: key.definition_name.clone(),
                    path: bundle.path.display().to_string(),
                    size_bytes: size,
                    token: is_content.then(|| bundle.token.clone()),
                });
                true
            }
            Err(err) => {
                tracing::warn!(%key, bundle = %bundle.path.display(), error = %err, "bundle send failed; will retry");
                self.journal.send(ActivityEvent::SendFailed {
                    resource_id: key.resource_id,
                    definition: key.definition_name.clone(),
                    path: bundle.path.display().to_string(),
                    error_code: err.code().to_string(),
                    error_message: err.to_string(),
                });
                false
            }
        }
    }

    /// The server has the change-sets: drop the previous change-set and the
    /// change-set bundles. Bundles created after the newest handed-off one
    /// (not yet sent) are kept; with nothing handed off in this process, all
    /// are removed. Idempotent.
    pub fn ack_change_set(&self, key: &ScheduleKey) -> Result<usize> {
        let bundles = self.store.pending_change_set_bundles(key)?;
        let newest_sent = {
            let handed_off = self.handed_off.lock();
            bundles
                .iter()
                .filter(|b| handed_off.contains(&b.path))
                .map(|b| b.created_millis)
                .max()
        };

        self.store.purge_previous(key)?;
        let mut removed = 0;
        for bundle in bundles {
            if newest_sent.is_some_and(|newest| bundle.created_millis > newest) {
                continue;
            }
            match std::fs::remove_file(&bundle.path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(DriftError::io(&bundle.path, err)),
            }
            self.handed_off.lock().remove(&bundle.path);
        }

        tracing::info!(%key, bundles_removed = removed, "change-set acknowledged");
        self.journal.send(ActivityEvent::ChangeSetAcked {
            resource_id: key.resource_id,
            definition: key.definition_name.clone(),
            bundles_removed: removed,
        });
        Ok(removed)
    }

    /// The server has the content bundle `token`: delete it and the blobs it
    /// carried. Unknown tokens are a no-op. Returns the number of blobs
    /// removed.
    pub fn ack_change_set_content(&self, key: &ScheduleKey, token: &str) -> Result<usize> {
        let path = self.store.content_bundle_path(key, token);
        if !path.is_file() {
            tracing::debug!(%key, %token, "content ack for unknown bundle");
            return Ok(0);
        }
        let digests: Vec<Digest> = entry_names(&path)?
            .iter()
            .filter_map(|name| Digest::parse(name))
            .collect();
        let removed = self.store.purge_content(key, &digests)?;
        self.store.purge_content_bundle(key, token)?;
        self.handed_off.lock().remove(&path);

        tracing::info!(%key, %token, blobs_removed = removed, "content acknowledged");
        self.journal.send(ActivityEvent::ContentAcked {
            resource_id: key.resource_id,
            definition: key.definition_name.clone(),
            token: token.to_string(),
            blobs_removed: removed,
        });
        Ok(removed)
    }

    /// Forget handed-off bundles of a purged definition.
    pub fn forget(&self, key: &ScheduleKey) {
        let dir = self.store.definition_dir(key);
        self.handed_off.lock().retain(|path| !path.starts_with(&dir));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::bundle::read_entry;
    use crate::drift::changeset::{Category, FileEntry, Header};
    use crate::scanner::digest::digest;
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        fail_change_sets: AtomicBool,
        change_sets: Mutex<Vec<Vec<u8>>>,
        content: Mutex<Vec<(String, String)>>,
    }

    impl DriftServer for Recorder {
        fn send_change_set_bundle(&self, _: u32, size: u64, stream: &mut dyn Read) -> Result<()> {
            if self.fail_change_sets.load(Ordering::SeqCst) {
                return Err(DriftError::Transport {
                    details: "server unavailable".to_string(),
                });
            }
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).unwrap();
            assert_eq!(buf.len() as u64, size);
            self.change_sets.lock().push(buf);
            Ok(())
        }

        fn send_content_bundle(
            &self,
            _: u32,
            definition_name: &str,
            token: &str,
            _: u64,
            _: &mut dyn Read,
        ) -> Result<()> {
            self.content
                .lock()
                .push((definition_name.to_string(), token.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        store: ChangeSetStore,
        server: Arc<Recorder>,
        coordinator: DriftCoordinator,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = ChangeSetStore::open(tmp.path().join("data")).unwrap();
        let server = Arc::new(Recorder::default());
        let coordinator =
            DriftCoordinator::new(store.clone(), server.clone(), JournalHandle::detached());
        Fixture {
            _tmp: tmp,
            store,
            server,
            coordinator,
        }
    }

    fn key() -> ScheduleKey {
        ScheduleKey::new(1, "conf")
    }

    fn write_coverage(f: &Fixture) -> Vec<DirectoryEntry> {
        let entries =
            vec![DirectoryEntry::new(".").with_file(FileEntry::added("a.conf", digest(b"H1")))];
        f.store.store_content(&key(), &digest(b"H1"), b"H1").unwrap();
        let header = Header {
            definition_name: "conf".to_string(),
            basedir_path: "/etc".to_string(),
            category: Category::Coverage,
            version: 0,
        };
        f.store.write(&key(), &header, &entries).unwrap();
        entries
    }

    #[test]
    fn ready_change_set_is_bundled_and_sent() {
        let f = fixture();
        let entries = write_coverage(&f);
        let ready = f.coordinator.change_set_ready(&key(), &entries).unwrap();

        assert_eq!(ready.flush.change_sets_sent, 1);
        assert_eq!(ready.flush.content_sent, 1);
        assert!(f.coordinator.is_handed_off(&ready.change_set_bundle));
        let text = read_entry(&ready.change_set_bundle, CHANGE_SET_FILE).unwrap();
        assert!(String::from_utf8(text).unwrap().starts_with("conf\n/etc\nC\n0\n"));

        let token = ready.content_token.unwrap();
        assert_eq!(f.server.content.lock()[0], ("conf".to_string(), token.clone()));
        let names = entry_names(&f.store.content_bundle_path(&key(), &token)).unwrap();
        assert_eq!(names, vec![digest(b"H1").to_string()]);
    }

    #[test]
    fn handed_off_bundles_are_not_resent() {
        let f = fixture();
        let entries = write_coverage(&f);
        f.coordinator.change_set_ready(&key(), &entries).unwrap();
        let again = f.coordinator.flush_pending(&key()).unwrap();
        assert_eq!(again, FlushReport::default());
        assert_eq!(f.server.change_sets.lock().len(), 1);
    }

    #[test]
    fn failed_sends_keep_bundles_for_retry() {
        let f = fixture();
        f.server.fail_change_sets.store(true, Ordering::SeqCst);
        let entries = write_coverage(&f);
        let ready = f.coordinator.change_set_ready(&key(), &entries).unwrap();
        assert_eq!(ready.flush.failures, 1);
        assert_eq!(ready.flush.content_sent, 0);
        assert!(ready.change_set_bundle.exists());

        f.server.fail_change_sets.store(false, Ordering::SeqCst);
        let retry = f.coordinator.flush_all().unwrap();
        assert_eq!(retry.change_sets_sent, 1);
        assert_eq!(retry.content_sent, 1);
    }

    #[test]
    fn change_set_ack_is_idempotent() {
        let f = fixture();
        let entries = write_coverage(&f);
        let ready = f.coordinator.change_set_ready(&key(), &entries).unwrap();

        assert_eq!(f.coordinator.ack_change_set(&key()).unwrap(), 1);
        assert!(!ready.change_set_bundle.exists());
        assert_eq!(f.coordinator.ack_change_set(&key()).unwrap(), 0);
        assert!(f.store.has_change_set(&key()));
    }

    #[test]
    fn unsent_newer_bundles_survive_an_ack() {
        let f = fixture();
        let entries = write_coverage(&f);
        f.coordinator.change_set_ready(&key(), &entries).unwrap();

        f.server.fail_change_sets.store(true, Ordering::SeqCst);
        let header = Header {
            definition_name: "conf".to_string(),
            basedir_path: "/etc".to_string(),
            category: Category::Drift,
            version: 1,
        };
        let drift =
            vec![DirectoryEntry::new(".").with_file(FileEntry::removed("a.conf", digest(b"H1")))];
        f.store.write(&key(), &header, &drift).unwrap();
        let second = f.coordinator.change_set_ready(&key(), &drift).unwrap();

        assert_eq!(f.coordinator.ack_change_set(&key()).unwrap(), 1);
        assert!(second.change_set_bundle.exists());
    }

    #[test]
    fn content_ack_removes_bundle_and_blobs() {
        let f = fixture();
        let entries = write_coverage(&f);
        let token = f
            .coordinator
            .change_set_ready(&key(), &entries)
            .unwrap()
            .content_token
            .unwrap();

        assert_eq!(f.coordinator.ack_change_set_content(&key(), &token).unwrap(), 1);
        assert!(f.store.list_content(&key()).unwrap().is_empty());
        assert!(f.store.pending_content_bundles(&key()).unwrap().is_empty());
        assert_eq!(f.coordinator.ack_change_set_content(&key(), &token).unwrap(), 0);
        assert_eq!(f.coordinator.ack_change_set_content(&key(), "bogus").unwrap(), 0);
    }
}
