//! Schedule queue: which definition is scanned next.
//!
//! Queued schedules live in a `BTreeMap` keyed by (disabled, next scan,
//! insertion sequence), which gives enabled-before-disabled, earliest first,
//! FIFO on ties. A popped schedule moves to the active map until its worker
//! deactivates it; at most one scan per schedule is ever in flight.
//! Scheduling a key again while its scan is pending removal parks the new
//! schedule until the old one has been purged.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::drift::definition::{
    DriftDefinition, DriftDetectionSchedule, ResourceId, ScheduleKey, ScheduleState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueOrder {
    disabled: bool,
    next_scan: DateTime<Utc>,
    seq: u64,
}

/// Outcome of unscheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Was queued and is gone; the caller purges its directory now.
    Dequeued(DriftDetectionSchedule),
    /// A scan is in flight; the schedule is PendingRemoval and is purged when
    /// its worker deactivates it.
    Deferred,
    NotFound,
}

/// Outcome of a worker handing a schedule back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deactivation {
    Requeued { next_scan: DateTime<Utc> },
    /// It was unscheduled mid-scan; the caller purges its directory now.
    Removed(DriftDetectionSchedule),
    NotActive,
}

#[derive(Debug, Default)]
pub struct ScheduleQueue {
    queued: BTreeMap<QueueOrder, DriftDetectionSchedule>,
    index: HashMap<ScheduleKey, QueueOrder>,
    active: HashMap<ScheduleKey, DriftDetectionSchedule>,
    /// Schedules submitted while the same key is PendingRemoval; queued by
    /// `finish_removal` once the old directory is gone.
    resubmitted: HashMap<ScheduleKey, DriftDetectionSchedule>,
    next_seq: u64,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queued.len() + self.active.len() + self.resubmitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.active.is_empty() && self.resubmitted.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Add a schedule. Returns `false` (and changes nothing) when a schedule
    /// with the same key is already queued or in flight. A key whose scan is
    /// pending removal accepts the schedule as a resubmission.
    pub fn enqueue(&mut self, mut schedule: DriftDetectionSchedule) -> bool {
        let key = schedule.key();
        if self.index.contains_key(&key) || self.resubmitted.contains_key(&key) {
            return false;
        }
        schedule.state = ScheduleState::Queued;
        match self.active.get(&key) {
            Some(active) if active.state == ScheduleState::PendingRemoval => {
                self.resubmitted.insert(key, schedule);
            }
            Some(_) => return false,
            None => self.insert_queued(key, schedule),
        }
        true
    }

    /// Queue the resubmission parked for `key`, if any. Called after the
    /// removed schedule's directory has been purged.
    pub fn finish_removal(&mut self, key: &ScheduleKey) -> bool {
        if self.active.contains_key(key) {
            return false;
        }
        match self.resubmitted.remove(key) {
            Some(schedule) => {
                self.insert_queued(key.clone(), schedule);
                true
            }
            None => false,
        }
    }

    fn insert_queued(&mut self, key: ScheduleKey, schedule: DriftDetectionSchedule) {
        let order = QueueOrder {
            disabled: !schedule.definition.enabled,
            next_scan: schedule.next_scan,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.index.insert(key, order);
        self.queued.insert(order, schedule);
    }

    fn take_queued(&mut self, key: &ScheduleKey) -> Option<DriftDetectionSchedule> {
        let order = self.index.remove(key)?;
        self.queued.remove(&order)
    }

    /// Pop the head (whatever its due time) and mark it Active.
    pub fn get_next_schedule(&mut self) -> Option<DriftDetectionSchedule> {
        let (_, schedule) = self.queued.pop_first()?;
        Some(self.activate(schedule))
    }

    /// Pop the head only if it is enabled and due at `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<DriftDetectionSchedule> {
        let (order, _) = self.queued.first_key_value()?;
        if order.disabled || order.next_scan > now {
            return None;
        }
        self.get_next_schedule()
    }

    fn activate(&mut self, mut schedule: DriftDetectionSchedule) -> DriftDetectionSchedule {
        let key = schedule.key();
        self.index.remove(&key);
        schedule.state = ScheduleState::Active;
        self.active.insert(key, schedule.clone());
        schedule
    }

    /// How long until the head enabled schedule is due; `None` when nothing
    /// enabled is queued.
    pub fn time_until_due(&self, now: DateTime<Utc>) -> Option<Duration> {
        let (order, _) = self.queued.first_key_value()?;
        if order.disabled {
            return None;
        }
        Some((order.next_scan - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Queued, resubmitted, or in flight (and not pending removal).
    pub fn contains(&self, resource_id: ResourceId, definition_name: &str) -> bool {
        let key = ScheduleKey::new(resource_id, definition_name);
        self.index.contains_key(&key)
            || self.resubmitted.contains_key(&key)
            || self
                .active
                .get(&key)
                .is_some_and(|s| s.state == ScheduleState::Active)
    }

    pub fn remove(&mut self, resource_id: ResourceId, definition_name: &str) -> Removal {
        let key = ScheduleKey::new(resource_id, definition_name);
        if let Some(schedule) = self.take_queued(&key) {
            return Removal::Dequeued(schedule);
        }
        match self.active.get_mut(&key) {
            Some(schedule) => {
                schedule.state = ScheduleState::PendingRemoval;
                self.resubmitted.remove(&key);
                Removal::Deferred
            }
            None => Removal::NotFound,
        }
    }

    /// Hand an active schedule back: requeue at `now + interval`, or report
    /// that it was unscheduled while scanning.
    pub fn deactivate_schedule(&mut self, key: &ScheduleKey, now: DateTime<Utc>) -> Deactivation {
        let Some(mut schedule) = self.active.remove(key) else {
            return Deactivation::NotActive;
        };
        if schedule.state == ScheduleState::PendingRemoval {
            return Deactivation::Removed(schedule);
        }
        schedule.reschedule_from(now);
        let next_scan = schedule.next_scan;
        schedule.state = ScheduleState::Queued;
        self.insert_queued(key.clone(), schedule);
        Deactivation::Requeued { next_scan }
    }

    /// Alias kept for the worker loop's vocabulary.
    pub fn requeue(&mut self, key: &ScheduleKey, now: DateTime<Utc>) -> Deactivation {
        self.deactivate_schedule(key, now)
    }

    /// Replace a schedule's definition. A queued schedule keeps its next scan
    /// time but moves if its enabled flag changed; an active one picks the
    /// new definition up when it is requeued.
    pub fn update(&mut self, resource_id: ResourceId, definition: DriftDefinition) -> bool {
        let key = ScheduleKey::new(resource_id, definition.name.clone());
        if let Some(mut schedule) = self.take_queued(&key) {
            schedule.definition = definition;
            self.insert_queued(key, schedule);
            return true;
        }
        if let Some(schedule) = self.resubmitted.get_mut(&key) {
            schedule.definition = definition;
            return true;
        }
        match self.active.get_mut(&key) {
            Some(schedule) if schedule.state == ScheduleState::Active => {
                schedule.definition = definition;
                true
            }
            _ => false,
        }
    }

    /// Move a queued schedule to the front of its class. `false` when the
    /// schedule is unknown or already scanning.
    pub fn schedule_immediately(
        &mut self,
        resource_id: ResourceId,
        definition_name: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let key = ScheduleKey::new(resource_id, definition_name);
        if let Some(schedule) = self.resubmitted.get_mut(&key) {
            schedule.next_scan = now;
            return true;
        }
        let Some(mut schedule) = self.take_queued(&key) else {
            return false;
        };
        schedule.next_scan = now;
        self.insert_queued(key, schedule);
        true
    }

    /// Every schedule: queued ones in drain order, then active ones by key,
    /// then resubmissions by key.
    pub fn schedules(&self) -> Vec<DriftDetectionSchedule> {
        let mut out: Vec<_> = self.queued.values().cloned().collect();
        let mut active: Vec<_> = self.active.values().cloned().collect();
        active.sort_by_key(DriftDetectionSchedule::key);
        out.extend(active);
        let mut resubmitted: Vec<_> = self.resubmitted.values().cloned().collect();
        resubmitted.sort_by_key(DriftDetectionSchedule::key);
        out.extend(resubmitted);
        out
    }
}

/// Thread-safe queue that parks workers until a schedule is due.
#[derive(Debug, Default)]
pub struct SharedScheduleQueue {
    inner: Mutex<ScheduleQueue>,
    changed: Condvar,
}

impl SharedScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` under the lock and wake waiting workers afterwards.
    pub fn with<R>(&self, f: impl FnOnce(&mut ScheduleQueue) -> R) -> R {
        let result = f(&mut self.inner.lock());
        self.changed.notify_all();
        result
    }

    /// Read-only access under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&ScheduleQueue) -> R) -> R {
        f(&self.inner.lock())
    }

    pub fn enqueue(&self, schedule: DriftDetectionSchedule) -> bool {
        self.with(|q| q.enqueue(schedule))
    }

    pub fn remove(&self, resource_id: ResourceId, definition_name: &str) -> Removal {
        self.with(|q| q.remove(resource_id, definition_name))
    }

    pub fn deactivate_schedule(&self, key: &ScheduleKey) -> Deactivation {
        self.with(|q| q.deactivate_schedule(key, Utc::now()))
    }

    pub fn finish_removal(&self, key: &ScheduleKey) -> bool {
        self.with(|q| q.finish_removal(key))
    }

    pub fn update(&self, resource_id: ResourceId, definition: DriftDefinition) -> bool {
        self.with(|q| q.update(resource_id, definition))
    }

    pub fn schedule_immediately(&self, resource_id: ResourceId, definition_name: &str) -> bool {
        self.with(|q| q.schedule_immediately(resource_id, definition_name, Utc::now()))
    }

    pub fn contains(&self, resource_id: ResourceId, definition_name: &str) -> bool {
        self.inspect(|q| q.contains(resource_id, definition_name))
    }

    pub fn schedules(&self) -> Vec<DriftDetectionSchedule> {
        self.inspect(ScheduleQueue::schedules)
    }

    pub fn len(&self) -> usize {
        self.inspect(ScheduleQueue::len)
    }

    pub fn is_empty(&self) -> bool {
        self.inspect(ScheduleQueue::is_empty)
    }

    /// Wake every parked worker (used on shutdown).
    pub fn wake_all(&self) {
        let _guard = self.inner.lock();
        self.changed.notify_all();
    }

    /// Block until a schedule is due or `shutdown` is set. Sleeps at most
    /// `idle_poll` between checks so a shutdown flag set without a wakeup is
    /// still noticed.
    pub fn next_due(
        &self,
        shutdown: &AtomicBool,
        idle_poll: Duration,
    ) -> Option<DriftDetectionSchedule> {
        let mut queue = self.inner.lock();
        loop {
            if shutdown.load(Ordering::Acquire) {
                return None;
            }
            let now = Utc::now();
            if let Some(schedule) = queue.pop_due(now) {
                return Some(schedule);
            }
            let wait = queue
                .time_until_due(now)
                .map_or(idle_poll, |due| due.min(idle_poll))
                .max(Duration::from_millis(1));
            self.changed.wait_for(&mut queue, wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::definition::BaseDirectory;
    use std::sync::Arc;
    use std::thread;

    fn definition(name: &str, enabled: bool) -> DriftDefinition {
        let mut def = DriftDefinition::new(
            name,
            BaseDirectory::file_system("/etc"),
            Duration::from_secs(60),
        );
        def.enabled = enabled;
        def
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn schedule(id: ResourceId, name: &str, enabled: bool, secs: i64) -> DriftDetectionSchedule {
        DriftDetectionSchedule::due_at(id, definition(name, enabled), at(secs))
    }

    #[test]
    fn drains_enabled_by_next_scan_then_disabled() {
        let mut q = ScheduleQueue::new();
        q.enqueue(schedule(1, "off", false, 0));
        q.enqueue(schedule(1, "late", true, 30));
        q.enqueue(schedule(1, "early", true, 10));
        q.enqueue(schedule(2, "early-too", true, 10));

        let order: Vec<String> = std::iter::from_fn(|| q.get_next_schedule())
            .map(|s| s.definition.name)
            .collect();
        assert_eq!(order, vec!["early", "early-too", "late", "off"]);
    }

    #[test]
    fn pop_due_respects_time_and_disabled() {
        let mut q = ScheduleQueue::new();
        q.enqueue(schedule(1, "off", false, 0));
        assert!(q.pop_due(at(100)).is_none());
        assert_eq!(q.time_until_due(at(100)), None);

        q.enqueue(schedule(1, "on", true, 50));
        assert!(q.pop_due(at(49)).is_none());
        assert_eq!(q.time_until_due(at(40)), Some(Duration::from_secs(10)));
        let popped = q.pop_due(at(50)).unwrap();
        assert_eq!(popped.state, ScheduleState::Active);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut q = ScheduleQueue::new();
        assert!(q.enqueue(schedule(1, "a", true, 0)));
        assert!(!q.enqueue(schedule(1, "a", true, 5)));
        let active = q.get_next_schedule().unwrap();
        assert!(!q.enqueue(schedule(1, "a", true, 5)));
        assert!(q.contains(1, "a"));
        assert_eq!(active.key(), ScheduleKey::new(1, "a"));
    }

    #[test]
    fn removing_a_queued_schedule_dequeues_it() {
        let mut q = ScheduleQueue::new();
        q.enqueue(schedule(1, "a", true, 0));
        assert!(matches!(q.remove(1, "a"), Removal::Dequeued(s) if s.definition.name == "a"));
        assert!(!q.contains(1, "a"));
        assert_eq!(q.remove(1, "a"), Removal::NotFound);
        assert!(q.is_empty());
    }

    #[test]
    fn removing_an_active_schedule_is_deferred_to_deactivation() {
        let mut q = ScheduleQueue::new();
        q.enqueue(schedule(1, "a", true, 0));
        let active = q.get_next_schedule().unwrap();

        assert_eq!(q.remove(1, "a"), Removal::Deferred);
        assert!(!q.contains(1, "a"));
        assert!(!q.update(1, definition("a", true)));

        match q.deactivate_schedule(&active.key(), at(10)) {
            Deactivation::Removed(s) => assert_eq!(s.state, ScheduleState::PendingRemoval),
            other => panic!("expected removal, got {other:?}"),
        }
        assert!(q.is_empty());
        assert_eq!(
            q.deactivate_schedule(&active.key(), at(10)),
            Deactivation::NotActive
        );
    }

    #[test]
    fn rescheduling_during_pending_removal_survives_the_purge() {
        let mut q = ScheduleQueue::new();
        q.enqueue(schedule(1, "a", true, 0));
        let active = q.get_next_schedule().unwrap();
        assert_eq!(q.remove(1, "a"), Removal::Deferred);

        assert!(q.enqueue(schedule(1, "a", true, 20)));
        assert!(!q.enqueue(schedule(1, "a", true, 30)));
        assert!(q.contains(1, "a"));
        assert!(q.update(1, definition("a", true)));
        assert!(!q.finish_removal(&active.key()));
        assert!(q.pop_due(at(100)).is_none());

        assert!(matches!(
            q.deactivate_schedule(&active.key(), at(10)),
            Deactivation::Removed(_)
        ));
        assert!(q.contains(1, "a"));
        assert!(q.finish_removal(&active.key()));
        assert!(!q.finish_removal(&active.key()));

        let next = q.pop_due(at(100)).unwrap();
        assert_eq!(next.key(), active.key());
        assert_eq!(next.next_scan, at(20));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn unscheduling_again_drops_the_resubmission() {
        let mut q = ScheduleQueue::new();
        q.enqueue(schedule(1, "a", true, 0));
        let active = q.get_next_schedule().unwrap();
        q.remove(1, "a");
        q.enqueue(schedule(1, "a", true, 20));

        assert_eq!(q.remove(1, "a"), Removal::Deferred);
        assert!(!q.contains(1, "a"));
        assert!(matches!(
            q.deactivate_schedule(&active.key(), at(10)),
            Deactivation::Removed(_)
        ));
        assert!(!q.finish_removal(&active.key()));
        assert!(q.is_empty());
    }

    #[test]
    fn deactivation_requeues_at_now_plus_interval() {
        let mut q = ScheduleQueue::new();
        q.enqueue(schedule(1, "a", true, 0));
        let active = q.get_next_schedule().unwrap();
        assert_eq!(
            q.requeue(&active.key(), at(100)),
            Deactivation::Requeued { next_scan: at(160) }
        );
        let s = &q.schedules()[0];
        assert_eq!(s.state, ScheduleState::Queued);
        assert_eq!(s.next_scan, at(160));
    }

    #[test]
    fn update_moves_schedule_between_classes() {
        let mut q = ScheduleQueue::new();
        q.enqueue(schedule(1, "a", true, 0));
        q.enqueue(schedule(1, "b", true, 10));
        assert!(q.update(1, definition("a", false)));
        assert_eq!(q.get_next_schedule().unwrap().definition.name, "b");
        let a = q.get_next_schedule().unwrap();
        assert!(!a.definition.enabled);
        assert!(!q.update(9, definition("zzz", true)));
    }

    #[test]
    fn schedule_immediately_jumps_the_queue() {
        let mut q = ScheduleQueue::new();
        q.enqueue(schedule(1, "a", true, 10));
        q.enqueue(schedule(1, "b", true, 500));
        assert!(q.schedule_immediately(1, "b", at(0)));
        assert_eq!(q.pop_due(at(0)).unwrap().definition.name, "b");
        assert!(!q.schedule_immediately(1, "b", at(0)));
    }

    #[test]
    fn shared_queue_wakes_worker_on_enqueue() {
        let queue = Arc::new(SharedScheduleQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let queue = Arc::clone(&queue);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || queue.next_due(&shutdown, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.enqueue(DriftDetectionSchedule::new(1, definition("a", true)));
        let got = worker.join().unwrap().unwrap();
        assert_eq!(got.definition.name, "a");
        assert_eq!(queue.inspect(ScheduleQueue::active_count), 1);
    }

    #[test]
    fn shared_queue_returns_none_on_shutdown() {
        let queue = Arc::new(SharedScheduleQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let queue = Arc::clone(&queue);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || queue.next_due(&shutdown, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        shutdown.store(true, Ordering::Release);
        queue.wake_all();
        assert!(worker.join().unwrap().is_none());
    }
}
