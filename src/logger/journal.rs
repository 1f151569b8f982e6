//! Activity journal: a dedicated thread owns the [`JsonlWriter`]; every other
//! thread sends [`ActivityEvent`]s through a bounded crossbeam channel.
//! `send()` uses `try_send()`, so a slow disk never stalls a scan.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::errors::{DriftError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

const CHANNEL_CAPACITY: usize = 1024;
const RECOVER_EVERY: Duration = Duration::from_secs(60);

/// Events recorded in the journal.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    AgentStarted {
        version: String,
        config_hash: String,
        schedules: usize,
    },
    AgentStopped {
        reason: String,
        uptime_secs: u64,
    },
    CoverageRecorded {
        resource_id: u32,
        definition: String,
        version: u32,
        files: usize,
        duration_ms: u64,
    },
    DriftDetected {
        resource_id: u32,
        definition: String,
        version: u32,
        added: usize,
        changed: usize,
        removed: usize,
        duration_ms: u64,
    },
    BaseDirMissing {
        resource_id: u32,
        definition: String,
        path: String,
    },
    BundleSent {
        resource_id: u32,
        definition: String,
        path: String,
        size_bytes: u64,
        token: Option<String>,
    },
    SendFailed {
        resource_id: u32,
        definition: String,
        path: String,
        error_code: String,
        error_message: String,
    },
    ChangeSetAcked {
        resource_id: u32,
        definition: String,
        bundles_removed: usize,
    },
    ContentAcked {
        resource_id: u32,
        definition: String,
        token: String,
        blobs_removed: usize,
    },
    SchedulePurged {
        resource_id: u32,
        definition: String,
    },
    ConfigReloaded {
        details: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Asks the journal thread to flush and exit.
    Shutdown,
}

impl ActivityEvent {
    /// Journal entry for an error, keeping its stable code.
    pub fn error(err: &DriftError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Cheap, cloneable sender side of the journal.
#[derive(Debug, Clone)]
pub struct JournalHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl JournalHandle {
    /// A handle plus the raw receiving end, for callers that consume events
    /// themselves (tests, embedding agents).
    pub fn channel(capacity: usize) -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped_events: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A handle connected to nothing; every event is discarded.
    pub fn detached() -> Self {
        Self::channel(1).0
    }

    /// Non-blocking. A full channel drops the event and bumps the counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the journal thread to flush and stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send_timeout(ActivityEvent::Shutdown, Duration::from_secs(1));
    }
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl JournalConfig {
    pub fn new(jsonl: JsonlConfig) -> Self {
        Self {
            jsonl,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the journal thread. It runs until `shutdown()` or until every
/// handle is dropped.
pub fn spawn_journal(config: JournalConfig) -> Result<(JournalHandle, thread::JoinHandle<()>)> {
    let (handle, rx) = JournalHandle::channel(config.channel_capacity);
    let dropped = Arc::clone(&handle.dropped_events);

    let join = thread::Builder::new()
        .name("driftd-journal".to_string())
        .spawn(move || journal_thread_main(&rx, config.jsonl, &dropped))
        .map_err(|e| DriftError::Runtime {
            details: format!("failed to spawn journal thread: {e}"),
        })?;

    Ok((handle, join))
}

fn journal_thread_main(rx: &Receiver<ActivityEvent>, jsonl: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(jsonl);
    let mut last_recover = std::time::Instant::now();

    loop {
        let event = match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                writer.flush();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{lost} journal events dropped due to back-pressure"));
            writer.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        if last_recover.elapsed() >= RECOVER_EVERY {
            writer.try_recover();
            last_recover = std::time::Instant::now();
        }
        writer.write_entry(&to_log_entry(&event));
    }

    writer.flush();
    writer.fsync();
}

#[allow(clippy::too_many_lines)]
pub fn to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::AgentStarted {
            version,
            config_hash,
            schedules,
        } => {
            let mut e = LogEntry::new(EventType::AgentStart, Severity::Info);
            e.details = Some(format!(
                "version={version} config_hash={config_hash} schedules={schedules}"
            ));
            e.ok = Some(true);
            e
        }
        ActivityEvent::AgentStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::AgentStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::CoverageRecorded {
            resource_id,
            definition,
            version,
            files,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::CoverageRecorded, Severity::Info)
                .for_definition(*resource_id, definition);
            e.version = Some(*version);
            e.added = Some(*files);
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::DriftDetected {
            resource_id,
            definition,
            version,
            added,
            changed,
            removed,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::DriftDetected, Severity::Warning)
                .for_definition(*resource_id, definition);
            e.version = Some(*version);
            e.added = Some(*added);
            e.changed = Some(*changed);
            e.removed = Some(*removed);
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::BaseDirMissing {
            resource_id,
            definition,
            path,
        } => {
            let mut e = LogEntry::new(EventType::BaseDirMissing, Severity::Warning)
                .for_definition(*resource_id, definition);
            e.path = Some(path.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::BundleSent {
            resource_id,
            definition,
            path,
            size_bytes,
            token,
        } => {
            let mut e = LogEntry::new(EventType::BundleSent, Severity::Info)
                .for_definition(*resource_id, definition);
            e.path = Some(path.clone());
            e.size = Some(*size_bytes);
            e.token.clone_from(token);
            e.ok = Some(true);
            e
        }
        ActivityEvent::SendFailed {
            resource_id,
            definition,
            path,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::SendFailed, Severity::Warning)
                .for_definition(*resource_id, definition);
            e.path = Some(path.clone());
            e.ok = Some(false);
            e.error_code = Some(error_code.clone());
            e.error_message = Some(error_message.clone());
            e
        }
        ActivityEvent::ChangeSetAcked {
            resource_id,
            definition,
            bundles_removed,
        } => {
            let mut e = LogEntry::new(EventType::ChangeSetAcked, Severity::Info)
                .for_definition(*resource_id, definition);
            e.details = Some(format!("bundles_removed={bundles_removed}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::ContentAcked {
            resource_id,
            definition,
            token,
            blobs_removed,
        } => {
            let mut e = LogEntry::new(EventType::ContentAcked, Severity::Info)
                .for_definition(*resource_id, definition);
            e.token = Some(token.clone());
            e.details = Some(format!("blobs_removed={blobs_removed}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::SchedulePurged {
            resource_id,
            definition,
        } => {
            let mut e = LogEntry::new(EventType::SchedulePurged, Severity::Info)
                .for_definition(*resource_id, definition);
            e.ok = Some(true);
            e
        }
        ActivityEvent::ConfigReloaded { details } => {
            let mut e = LogEntry::new(EventType::ConfigReload, Severity::Info);
            e.details = Some(details.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::AgentStop, Severity::Info),
    }
}
