//! Drift detector: one full detection cycle per due schedule, and the worker
//! loop that drives cycles off the shared queue.

#![allow(missing_docs)]

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use crate::core::errors::{DriftError, Result};
use crate::drift::changeset::{Category, Header};
use crate::drift::coordinator::DriftCoordinator;
use crate::drift::definition::{DriftDetectionSchedule, ScheduleKey};
use crate::drift::queue::{Deactivation, SharedScheduleQueue};
use crate::drift::store::{ChangeSetStore, ContentOutcome, Coverage};
use crate::drift::transport::DriftClient;
use crate::logger::journal::{ActivityEvent, JournalHandle};
use crate::scanner::analyzer::DirectoryAnalyzer;
use crate::scanner::filter::FilterSet;

/// What a single detection cycle produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    Coverage {
        version: u32,
        files: usize,
    },
    Drift {
        version: u32,
        added: usize,
        changed: usize,
        removed: usize,
    },
    /// Drift scan found nothing; no change-set was written.
    Unchanged,
    MissingBaseDirectory(PathBuf),
}

pub struct DriftDetector {
    store: ChangeSetStore,
    analyzer: DirectoryAnalyzer,
    client: Arc<dyn DriftClient>,
    coordinator: Arc<DriftCoordinator>,
    journal: JournalHandle,
}

impl DriftDetector {
    pub fn new(
        analyzer: DirectoryAnalyzer,
        client: Arc<dyn DriftClient>,
        coordinator: Arc<DriftCoordinator>,
        journal: JournalHandle,
    ) -> Self {
        Self {
            store: coordinator.store().clone(),
            analyzer,
            client,
            coordinator,
            journal,
        }
    }

    /// Run one detection cycle for `schedule`. The caller owns requeueing.
    pub fn detect(&self, schedule: &DriftDetectionSchedule) -> Result<DetectionOutcome> {
        let started = Instant::now();
        let key = schedule.key();
        let definition = &schedule.definition;

        let basedir = self
            .client
            .resolve_base_directory(schedule.resource_id, &definition.basedir)?;
        if !basedir.is_dir() {
            self.client
                .report_missing_base_directory(schedule.resource_id, definition, &basedir);
            self.journal.send(ActivityEvent::BaseDirMissing {
                resource_id: key.resource_id,
                definition: key.definition_name.clone(),
                path: basedir.display().to_string(),
            });
            return Ok(DetectionOutcome::MissingBaseDirectory(basedir));
        }

        let coverage = self.load_coverage(&key)?;
        let filters = FilterSet::for_definition(definition)?;
        let analysis = match self.analyzer.analyze(
            &basedir,
            &filters,
            coverage.as_ref().map(|c| &c.snapshot),
        ) {
            Ok(analysis) => analysis,
            // The basedir vanished between the check and the walk.
            Err(DriftError::MissingBaseDirectory { path }) => {
                self.client
                    .report_missing_base_directory(schedule.resource_id, definition, &path);
                return Ok(DetectionOutcome::MissingBaseDirectory(path));
            }
            Err(err) => return Err(err),
        };
        let diff = analysis.diff;

        if diff.category == Category::Drift && diff.is_empty() {
            tracing::debug!(%key, files = analysis.scan.snapshot.len(), "no drift");
            self.coordinator.flush_pending(&key)?;
            return Ok(DetectionOutcome::Unchanged);
        }

        let version = coverage.map_or(0, |c| c.version.saturating_add(1));
        let header = Header {
            definition_name: definition.name.clone(),
            basedir_path: basedir.to_string_lossy().into_owned(),
            category: diff.category,
            version,
        };
        let entries = diff.directory_entries();
        self.store.write(&key, &header, &entries)?;

        // Blobs only for change-sets that made it to disk.
        for change in diff.content_changes() {
            let Some(expected) = change.entry.current_digest() else {
                continue;
            };
            let source = basedir.join(change.relative_path());
            self.store_blob(&key, expected, &source);
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let outcome = match diff.category {
            Category::Coverage => {
                tracing::info!(%key, version, files = diff.added.len(), "coverage recorded");
                self.journal.send(ActivityEvent::CoverageRecorded {
                    resource_id: key.resource_id,
                    definition: key.definition_name.clone(),
                    version,
                    files: diff.added.len(),
                    duration_ms,
                });
                DetectionOutcome::Coverage {
                    version,
                    files: diff.added.len(),
                }
            }
            Category::Drift => {
                tracing::info!(
                    %key,
                    version,
                    added = diff.added.len(),
                    changed = diff.changed.len(),
                    removed = diff.removed.len(),
                    "drift detected"
                );
                self.journal.send(ActivityEvent::DriftDetected {
                    resource_id: key.resource_id,
                    definition: key.definition_name.clone(),
                    version,
                    added: diff.added.len(),
                    changed: diff.changed.len(),
                    removed: diff.removed.len(),
                    duration_ms,
                });
                DetectionOutcome::Drift {
                    version,
                    added: diff.added.len(),
                    changed: diff.changed.len(),
                    removed: diff.removed.len(),
                }
            }
        };

        self.coordinator.change_set_ready(&key, &entries)?;
        Ok(outcome)
    }

    /// Baseline for the next diff. An undecodable baseline is moved aside so
    /// the next change-set starts over as COVERAGE.
    fn load_coverage(&self, key: &ScheduleKey) -> Result<Option<Coverage>> {
        match self.store.read_coverage(key) {
            Ok(coverage) => Ok(coverage),
            Err(err @ (DriftError::ChangeSetFormat { .. } | DriftError::InvalidChangeSet { .. })) => {
                let moved = self.store.quarantine_coverage(key)?;
                tracing::error!(
                    %key,
                    error = %err,
                    quarantined = ?moved,
                    "corrupt coverage baseline; starting a new coverage"
                );
                self.journal.send(ActivityEvent::error(&err));
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn store_blob(&self, key: &ScheduleKey, expected: &crate::scanner::digest::Digest, source: &Path) {
        match self.store.store_content_file(key, expected, source) {
            Ok(ContentOutcome::Stored { .. } | ContentOutcome::AlreadyPresent) => {}
            Ok(ContentOutcome::Mismatch { actual }) => {
                tracing::warn!(
                    %key,
                    path = %source.display(),
                    %expected,
                    %actual,
                    "file changed while scanning; content not stored"
                );
            }
            Err(err) => {
                tracing::warn!(%key, path = %source.display(), error = %err, "content not stored");
            }
        }
    }

    /// Give a finished schedule back to the queue; purge its store directory
    /// if it was unscheduled mid-scan.
    pub fn complete(&self, queue: &SharedScheduleQueue, key: &ScheduleKey) -> Deactivation {
        let deactivation = queue.deactivate_schedule(key);
        if let Deactivation::Removed(_) = &deactivation {
            self.purge(key);
            if queue.finish_removal(key) {
                tracing::info!(%key, "rescheduled after purge");
            }
        }
        deactivation
    }

    /// Remove everything stored for an unscheduled definition.
    pub fn purge(&self, key: &ScheduleKey) {
        match self.store.purge_directory(key) {
            Ok(_) => {
                self.coordinator.forget(key);
                tracing::info!(%key, "schedule purged");
                self.journal.send(ActivityEvent::SchedulePurged {
                    resource_id: key.resource_id,
                    definition: key.definition_name.clone(),
                });
            }
            Err(err) => {
                tracing::error!(%key, error = %err, "failed to purge definition directory");
                self.journal.send(ActivityEvent::error(&err));
            }
        }
    }

    /// Worker loop: run cycles until `shutdown` is set. A failing or
    /// panicking cycle is logged and the schedule is requeued as usual.
    pub fn run(&self, queue: &SharedScheduleQueue, shutdown: &AtomicBool, idle_poll: Duration) {
        while let Some(schedule) = queue.next_due(shutdown, idle_poll) {
            let key = schedule.key();
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.detect(&schedule)));
            match result {
                Ok(Ok(outcome)) => tracing::debug!(%key, ?outcome, "detection cycle finished"),
                Ok(Err(err)) => {
                    tracing::error!(%key, code = err.code(), error = %err, "detection cycle failed");
                    self.journal.send(ActivityEvent::error(&err));
                }
                Err(_) => {
                    let err = DriftError::Runtime {
                        details: format!("detection cycle for {key} panicked"),
                    };
                    tracing::error!(%key, "detection cycle panicked");
                    self.journal.send(ActivityEvent::error(&err));
                }
            }
            self.complete(queue, &key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::changeset::{ChangeType, DirectoryEntry};
    use crate::drift::definition::{BaseDirectory, DriftDefinition};
    use crate::drift::queue::Removal;
    use crate::drift::transport::{FileSystemClient, SpoolServer};
    use crate::scanner::digest::digest;
    use std::fs;
    use std::sync::atomic::Ordering;
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        store: ChangeSetStore,
        detector: DriftDetector,
    }

    impl Fixture {
        fn basedir(&self) -> PathBuf {
            self.tmp.path().join("etc")
        }

        fn schedule(&self) -> DriftDetectionSchedule {
            let def = DriftDefinition::new(
                "conf",
                BaseDirectory::file_system(self.basedir().to_string_lossy()),
                Duration::from_secs(60),
            );
            DriftDetectionSchedule::new(7, def)
        }

        fn current_entries(&self) -> (Header, Vec<DirectoryEntry>) {
            self.store
                .get_reader(&ScheduleKey::new(7, "conf"))
                .unwrap()
                .unwrap()
                .read_all()
                .unwrap()
        }
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        let store = ChangeSetStore::open(tmp.path().join("data")).unwrap();
        let server = Arc::new(SpoolServer::new(tmp.path().join("outbox")).unwrap());
        let coordinator = Arc::new(DriftCoordinator::new(
            store.clone(),
            server,
            JournalHandle::detached(),
        ));
        let detector = DriftDetector::new(
            DirectoryAnalyzer::default(),
            Arc::new(FileSystemClient::new()),
            coordinator,
            JournalHandle::detached(),
        );
        Fixture {
            tmp,
            store,
            detector,
        }
    }

    #[test]
    fn first_cycle_records_coverage() {
        let f = fixture();
        fs::write(f.basedir().join("a.conf"), "H1").unwrap();

        let outcome = f.detector.detect(&f.schedule()).unwrap();
        assert_eq!(outcome, DetectionOutcome::Coverage { version: 0, files: 1 });

        let (header, entries) = f.current_entries();
        assert_eq!(header.category, Category::Coverage);
        assert_eq!(entries[0].files[0].change_type, ChangeType::Added);
        assert!(f.store.has_content(&ScheduleKey::new(7, "conf"), &digest(b"H1")));
    }

    #[test]
    fn second_cycle_reports_drift_against_coverage() {
        let f = fixture();
        fs::write(f.basedir().join("a.conf"), "H1").unwrap();
        f.detector.detect(&f.schedule()).unwrap();

        fs::remove_file(f.basedir().join("a.conf")).unwrap();
        fs::write(f.basedir().join("b.conf"), "H2").unwrap();
        let outcome = f.detector.detect(&f.schedule()).unwrap();
        assert_eq!(
            outcome,
            DetectionOutcome::Drift {
                version: 1,
                added: 1,
                changed: 0,
                removed: 1
            }
        );

        let (header, entries) = f.current_entries();
        assert_eq!(header.category, Category::Drift);
        assert_eq!(header.version, 1);
        let files = &entries[0].files;
        assert_eq!(files[0].file_name, "a.conf");
        assert_eq!(files[0].change_type, ChangeType::Removed);
        assert_eq!(files[0].old_digest, Some(digest(b"H1")));
        assert_eq!(files[1].file_name, "b.conf");
        assert_eq!(files[1].new_digest, Some(digest(b"H2")));
        assert!(f.store.previous_path(&ScheduleKey::new(7, "conf")).exists());
    }

    #[test]
    fn unchanged_tree_writes_nothing() {
        let f = fixture();
        fs::write(f.basedir().join("a.conf"), "H1").unwrap();
        f.detector.detect(&f.schedule()).unwrap();
        let outcome = f.detector.detect(&f.schedule()).unwrap();
        assert_eq!(outcome, DetectionOutcome::Unchanged);
        assert_eq!(f.current_entries().0.version, 0);
    }

    #[test]
    fn missing_basedir_is_reported_not_fatal() {
        let f = fixture();
        fs::remove_dir(f.basedir()).unwrap();
        let outcome = f.detector.detect(&f.schedule()).unwrap();
        assert_eq!(outcome, DetectionOutcome::MissingBaseDirectory(f.basedir()));
        assert!(!f.store.has_change_set(&ScheduleKey::new(7, "conf")));
    }

    #[test]
    fn corrupt_baseline_is_quarantined_and_coverage_restarts() {
        let f = fixture();
        fs::write(f.basedir().join("a.conf"), "H1").unwrap();
        f.detector.detect(&f.schedule()).unwrap();

        let key = ScheduleKey::new(7, "conf");
        fs::write(f.store.coverage_path(&key), "conf\n/etc\nC\n0\n. 2\n").unwrap();
        let outcome = f.detector.detect(&f.schedule()).unwrap();
        assert_eq!(outcome, DetectionOutcome::Coverage { version: 0, files: 1 });
        assert!(
            f.store
                .coverage_path(&key)
                .with_file_name("snapshot.txt.corrupt")
                .exists()
        );
    }

    #[cfg(unix)]
    #[test]
    fn name_with_line_break_does_not_block_the_change_set() {
        let f = fixture();
        fs::write(f.basedir().join("a.conf"), "H1").unwrap();
        fs::write(f.basedir().join("evil\nname"), "H2").unwrap();

        let outcome = f.detector.detect(&f.schedule()).unwrap();
        assert_eq!(outcome, DetectionOutcome::Coverage { version: 0, files: 1 });
        assert!(f.store.has_change_set(&ScheduleKey::new(7, "conf")));
        assert_eq!(f.current_entries().1[0].files.len(), 1);
    }

    #[test]
    fn failed_baseline_write_does_not_repeat_a_version() {
        let f = fixture();
        let key = ScheduleKey::new(7, "conf");
        fs::write(f.basedir().join("a.conf"), "H1").unwrap();
        f.detector.detect(&f.schedule()).unwrap();

        fs::write(f.basedir().join("b.conf"), "H2").unwrap();
        let blocker = f.store.coverage_path(&key).with_file_name("snapshot.txt.tmp");
        fs::create_dir(&blocker).unwrap();
        assert!(f.detector.detect(&f.schedule()).is_err());
        assert_eq!(f.current_entries().0.version, 0);

        fs::remove_dir(&blocker).unwrap();
        let outcome = f.detector.detect(&f.schedule()).unwrap();
        assert_eq!(
            outcome,
            DetectionOutcome::Drift {
                version: 1,
                added: 1,
                changed: 0,
                removed: 0
            }
        );
        let (header, _) = f
            .store
            .get_previous_reader(&key)
            .unwrap()
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(header.version, 0);
    }

    #[test]
    fn failed_change_set_write_stores_no_content() {
        let f = fixture();
        let key = ScheduleKey::new(7, "conf");
        fs::write(f.basedir().join("a.conf"), "H1").unwrap();
        let blocker = f.store.change_set_path(&key).with_file_name("changeset.txt.tmp");
        fs::create_dir_all(&blocker).unwrap();

        assert!(f.detector.detect(&f.schedule()).is_err());
        assert!(f.store.list_content(&key).unwrap().is_empty());
        assert!(!f.store.has_change_set(&key));

        fs::remove_dir(&blocker).unwrap();
        f.detector.detect(&f.schedule()).unwrap();
        assert_eq!(f.store.list_content(&key).unwrap(), vec![digest(b"H1")]);
    }

    #[test]
    fn worker_requeues_and_purges_after_deferred_unschedule() {
        let f = fixture();
        fs::write(f.basedir().join("a.conf"), "H1").unwrap();
        let queue = SharedScheduleQueue::new();
        let schedule = f.schedule();
        let key = schedule.key();
        queue.enqueue(schedule);

        let taken = queue.with(|q| q.get_next_schedule()).unwrap();
        f.detector.detect(&taken).unwrap();
        assert_eq!(queue.remove(7, "conf"), Removal::Deferred);
        assert!(matches!(
            f.detector.complete(&queue, &key),
            Deactivation::Removed(_)
        ));
        assert!(!f.store.definition_dir(&key).exists());
        assert!(queue.is_empty());
    }

    #[test]
    fn worker_loop_stops_on_shutdown() {
        let f = fixture();
        fs::write(f.basedir().join("a.conf"), "H1").unwrap();
        let queue = SharedScheduleQueue::new();
        queue.enqueue(f.schedule());
        let shutdown = AtomicBool::new(false);

        thread::scope(|scope| {
            scope.spawn(|| f.detector.run(&queue, &shutdown, Duration::from_millis(10)));
            let deadline = Instant::now() + Duration::from_secs(10);
            while !f.store.has_change_set(&ScheduleKey::new(7, "conf")) {
                assert!(Instant::now() < deadline, "worker never scanned");
                thread::sleep(Duration::from_millis(10));
            }
            shutdown.store(true, Ordering::Release);
            queue.wake_all();
        });
        assert_eq!(queue.len(), 1);
    }
}
