//! `DriftManager`: the single entry point that wires the store, queue,
//! detector workers and coordinator together.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::errors::{DriftError, Result};
use crate::drift::coordinator::DriftCoordinator;
use crate::drift::definition::{
    DriftDefinition, DriftDetectionSchedule, ResourceId, ScheduleKey, ScheduleState,
};
use crate::drift::detector::DriftDetector;
use crate::drift::queue::{Removal, SharedScheduleQueue};
use crate::drift::store::ChangeSetStore;
use crate::drift::transport::{DriftClient, DriftServer};
use crate::logger::journal::JournalHandle;
use crate::scanner::analyzer::{AnalyzerConfig, DirectoryAnalyzer};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub data_dir: PathBuf,
    pub worker_threads: usize,
    /// Longest a parked worker sleeps before re-checking the queue.
    pub idle_poll: Duration,
    pub analyzer: AnalyzerConfig,
}

impl ManagerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            worker_threads: 2,
            idle_poll: Duration::from_millis(500),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

/// What a `reconcile` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scheduled: usize,
    pub updated: usize,
    pub unscheduled: usize,
    /// Store directories with no schedule that were removed.
    pub orphans_purged: usize,
}

pub struct DriftManager {
    config: ManagerConfig,
    store: ChangeSetStore,
    queue: Arc<SharedScheduleQueue>,
    coordinator: Arc<DriftCoordinator>,
    detector: Arc<DriftDetector>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DriftManager {
    pub fn new(
        config: ManagerConfig,
        server: Arc<dyn DriftServer>,
        client: Arc<dyn DriftClient>,
        journal: JournalHandle,
    ) -> Result<Self> {
        let store = ChangeSetStore::open(&config.data_dir)?;
        let coordinator = Arc::new(DriftCoordinator::new(store.clone(), server, journal.clone()));
        let detector = Arc::new(DriftDetector::new(
            DirectoryAnalyzer::new(config.analyzer),
            client,
            Arc::clone(&coordinator),
            journal,
        ));
        Ok(Self {
            config,
            store,
            queue: Arc::new(SharedScheduleQueue::new()),
            coordinator,
            detector,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &ChangeSetStore {
        &self.store
    }

    pub fn queue(&self) -> &SharedScheduleQueue {
        &self.queue
    }

    pub fn coordinator(&self) -> &DriftCoordinator {
        &self.coordinator
    }

    pub fn detector(&self) -> &DriftDetector {
        &self.detector
    }

    // ──────────────────── scheduling ────────────────────

    /// Start watching `definition` on `resource_id`; the first scan is due
    /// immediately. `Ok(false)` when it is already scheduled.
    pub fn schedule_drift_detection(
        &self,
        resource_id: ResourceId,
        definition: DriftDefinition,
    ) -> Result<bool> {
        definition.validate()?;
        let key = ScheduleKey::new(resource_id, definition.name.clone());
        let added = self
            .queue
            .enqueue(DriftDetectionSchedule::new(resource_id, definition));
        if added {
            tracing::info!(%key, "drift detection scheduled");
        }
        Ok(added)
    }

    /// Stop watching a definition. A queued schedule is purged now; one that
    /// is mid-scan is purged by its worker when the scan finishes.
    pub fn unschedule_drift_detection(
        &self,
        resource_id: ResourceId,
        definition_name: &str,
    ) -> Removal {
        let removal = self.queue.remove(resource_id, definition_name);
        let key = ScheduleKey::new(resource_id, definition_name);
        match &removal {
            Removal::Dequeued(_) => self.detector.purge(&key),
            Removal::Deferred => tracing::info!(%key, "unscheduled mid-scan; purge deferred"),
            Removal::NotFound => tracing::debug!(%key, "unschedule of unknown schedule"),
        }
        removal
    }

    pub fn update_drift_detection(
        &self,
        resource_id: ResourceId,
        definition: DriftDefinition,
    ) -> Result<bool> {
        definition.validate()?;
        Ok(self.queue.update(resource_id, definition))
    }

    /// Pull a queued schedule forward so it is scanned next.
    pub fn detect_drift_now(&self, resource_id: ResourceId, definition_name: &str) -> bool {
        self.queue.schedule_immediately(resource_id, definition_name)
    }

    /// Schedule every queued definition immediately.
    pub fn detect_all_now(&self) -> usize {
        self.queue
            .schedules()
            .iter()
            .filter(|s| self.detect_drift_now(s.resource_id, &s.definition.name))
            .count()
    }

    /// Bring the schedules in line with `desired`: schedule new definitions,
    /// update changed ones, unschedule the rest, and purge store directories
    /// that belong to no schedule.
    pub fn reconcile(&self, desired: &[(ResourceId, DriftDefinition)]) -> Result<ReconcileReport> {
        for (_, definition) in desired {
            definition.validate()?;
        }
        let mut report = ReconcileReport::default();
        // A schedule pending removal is already gone; a desired one with the
        // same key is scheduled afresh and queued after the purge.
        let current: Vec<DriftDetectionSchedule> = self
            .queue
            .schedules()
            .into_iter()
            .filter(|s| s.state != ScheduleState::PendingRemoval)
            .collect();
        let wanted: HashSet<ScheduleKey> = desired
            .iter()
            .map(|(id, def)| ScheduleKey::new(*id, def.name.clone()))
            .collect();

        for (resource_id, definition) in desired {
            let existing = current
                .iter()
                .find(|s| s.matches(*resource_id, &definition.name));
            match existing {
                None => {
                    if self.schedule_drift_detection(*resource_id, definition.clone())? {
                        report.scheduled += 1;
                    }
                }
                Some(schedule) if schedule.definition != *definition => {
                    if self.queue.update(*resource_id, definition.clone()) {
                        report.updated += 1;
                    }
                }
                Some(_) => {}
            }
        }

        for schedule in &current {
            if wanted.contains(&schedule.key()) {
                continue;
            }
            if !matches!(
                self.unschedule_drift_detection(schedule.resource_id, &schedule.definition.name),
                Removal::NotFound
            ) {
                report.unscheduled += 1;
            }
        }

        let held: HashSet<ScheduleKey> = self
            .queue
            .schedules()
            .iter()
            .map(DriftDetectionSchedule::key)
            .collect();
        for key in self.store.definitions()? {
            if !held.contains(&key) {
                self.detector.purge(&key);
                report.orphans_purged += 1;
            }
        }

        tracing::info!(
            scheduled = report.scheduled,
            updated = report.updated,
            unscheduled = report.unscheduled,
            orphans_purged = report.orphans_purged,
            "schedules reconciled"
        );
        Ok(report)
    }

    // ──────────────────── acknowledgements ────────────────────

    pub fn ack_change_set(&self, resource_id: ResourceId, definition_name: &str) -> Result<usize> {
        self.coordinator
            .ack_change_set(&ScheduleKey::new(resource_id, definition_name))
    }

    pub fn ack_change_set_content(
        &self,
        resource_id: ResourceId,
        definition_name: &str,
        token: &str,
    ) -> Result<usize> {
        self.coordinator
            .ack_change_set_content(&ScheduleKey::new(resource_id, definition_name), token)
    }

    // ──────────────────── lifecycle ────────────────────

    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Re-send bundles left over from a previous run, then spawn `workers`
    /// detector threads.
    pub fn start(&self, workers: usize) -> Result<()> {
        let mut handles = self.workers.lock();
        if !handles.is_empty() {
            return Err(DriftError::Runtime {
                details: "drift manager already started".to_string(),
            });
        }
        self.shutdown.store(false, Ordering::Release);

        match self.coordinator.flush_all() {
            Ok(report) if report.change_sets_sent + report.content_sent > 0 => {
                tracing::info!(?report, "re-sent pending bundles");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "could not re-send pending bundles"),
        }

        for index in 0..workers.max(1) {
            let queue = Arc::clone(&self.queue);
            let detector = Arc::clone(&self.detector);
            let shutdown = Arc::clone(&self.shutdown);
            let idle_poll = self.config.idle_poll;
            let handle = thread::Builder::new()
                .name(format!("driftd-worker-{index}"))
                .spawn(move || detector.run(&queue, &shutdown, idle_poll))
                .map_err(|e| DriftError::Runtime {
                    details: format!("failed to spawn worker thread: {e}"),
                })?;
            handles.push(handle);
        }
        tracing::info!(workers = handles.len(), "drift workers started");
        Ok(())
    }

    /// Stop the workers after their current scans and wait for them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.wake_all();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let count = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("drift worker panicked during shutdown");
            }
        }
        if count > 0 {
            tracing::info!(workers = count, "drift workers stopped");
        }
    }
}

impl Drop for DriftManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
