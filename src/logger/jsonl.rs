//! Append-only JSONL activity journal.
//!
//! One self-contained JSON object per line, assembled in memory and written
//! with a single `write_all` so a tailing forwarder never sees half a line.
//!
//! Degradation chain, never fatal:
//! 1. Primary file path
//! 2. Fallback path (e.g. a RAM-backed `/dev/shm/driftd.jsonl`)
//! 3. stderr with a `[DRIFT-JSONL]` prefix
//! 4. Silent discard

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions, rename};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::core::errors::{DriftError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Journal event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStart,
    AgentStop,
    CoverageRecorded,
    DriftDetected,
    BaseDirMissing,
    BundleSent,
    SendFailed,
    ChangeSetAcked,
    ContentAcked,
    SchedulePurged,
    ConfigReload,
    Error,
}

/// One journal line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Change-set version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
    /// Bundle size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Content bundle token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// `DRIFT-xxxx` code when something failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            resource_id: None,
            definition: None,
            path: None,
            version: None,
            added: None,
            changed: None,
            removed: None,
            size: None,
            token: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    /// Attach the schedule identity.
    #[must_use]
    pub fn for_definition(mut self, resource_id: u32, definition: &str) -> Self {
        self.resource_id = Some(resource_id);
        self.definition = Some(definition.to_string());
        self
    }

    /// Attach an error's code and message and mark the entry failed.
    #[must_use]
    pub fn with_error(mut self, err: &DriftError) -> Self {
        self.ok = Some(false);
        self.error_code = Some(err.code().to_string());
        self.error_message = Some(err.to_string());
        self
    }
}

/// Where lines currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

impl WriterState {
    const fn label(self) -> &'static str {
        match self {
            Self::Primary => "normal",
            Self::Fallback => "fallback",
            Self::Stderr => "stderr",
            Self::Discard => "discard",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Used when the primary path cannot be opened or written.
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this size.
    pub max_size_bytes: u64,
    /// Rotated generations kept (`.1` newest).
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

impl JsonlConfig {
    /// Defaults with a specific primary path and no fallback.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: None,
            ..Self::default()
        }
    }
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/driftd/activity.jsonl"),
            fallback_path: Some(PathBuf::from("/dev/shm/driftd.jsonl")),
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

/// JSONL writer with size-based rotation and the degradation chain above.
pub struct JsonlWriter {
    config: JsonlConfig,
    file: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
    last_fsync: SystemTime,
}

impl JsonlWriter {
    /// Open the journal, falling down the chain until something works.
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            file: None,
            state: WriterState::Discard,
            bytes_written: 0,
            last_fsync: SystemTime::now(),
        };
        writer.attach(WriterState::Primary);
        writer
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.write_line(&line);
            }
            Err(e) => {
                let _ = writeln!(io::stderr(), "[DRIFT-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
            let _ = file.get_ref().sync_data();
        }
        self.last_fsync = SystemTime::now();
    }

    /// `normal`, `fallback`, `stderr` or `discard`.
    pub fn state(&self) -> &str {
        self.state.label()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Return to the primary path if it has become writable again.
    pub fn try_recover(&mut self) {
        if self.state == WriterState::Primary {
            return;
        }
        if let Ok((file, size)) = open_append(&self.config.path) {
            self.flush();
            self.file = Some(BufWriter::with_capacity(64 * 1024, file));
            self.state = WriterState::Primary;
            self.bytes_written = size;
            let _ = writeln!(
                io::stderr(),
                "[DRIFT-JSONL] recovered to primary path: {}",
                self.config.path.display()
            );
        }
    }

    // ──────────────────────── internals ────────────────────────

    fn current_path(&self) -> Option<&Path> {
        match self.state {
            WriterState::Primary => Some(&self.config.path),
            WriterState::Fallback => self.config.fallback_path.as_deref(),
            WriterState::Stderr | WriterState::Discard => None,
        }
    }

    /// Try `target` and every later level until one accepts output.
    fn attach(&mut self, target: WriterState) {
        self.file = None;
        let mut level = target;
        loop {
            let path = match level {
                WriterState::Primary => Some(self.config.path.clone()),
                WriterState::Fallback => self.config.fallback_path.clone(),
                WriterState::Stderr | WriterState::Discard => None,
            };
            if let Some(path) = path {
                if let Ok((file, size)) = open_append(&path) {
                    if level == WriterState::Fallback {
                        let _ = writeln!(
                            io::stderr(),
                            "[DRIFT-JSONL] primary path failed, using fallback: {}",
                            path.display()
                        );
                    }
                    self.file = Some(BufWriter::with_capacity(64 * 1024, file));
                    self.bytes_written = size;
                    self.state = level;
                    return;
                }
                level = next_level(level);
                continue;
            }
            if level == WriterState::Fallback {
                level = WriterState::Stderr;
                continue;
            }
            if level == WriterState::Stderr {
                let _ = writeln!(io::stderr(), "[DRIFT-JSONL] journal files unavailable, using stderr");
            }
            self.state = level;
            return;
        }
    }

    fn write_line(&mut self, line: &str) {
        if self.file.is_some()
            && self.bytes_written + line.len() as u64 > self.config.max_size_bytes
        {
            self.rotate();
        }

        match self.state {
            WriterState::Primary | WriterState::Fallback => {
                let written = self
                    .file
                    .as_mut()
                    .is_some_and(|file| file.write_all(line.as_bytes()).is_ok());
                if written {
                    self.bytes_written += line.len() as u64;
                    self.maybe_fsync();
                } else {
                    self.attach(next_level(self.state));
                    self.write_line(line);
                }
            }
            WriterState::Stderr => {
                if write!(io::stderr(), "[DRIFT-JSONL] {line}").is_err() {
                    self.state = WriterState::Discard;
                }
            }
            WriterState::Discard => {}
        }
    }

    fn maybe_fsync(&mut self) {
        let elapsed = SystemTime::now()
            .duration_since(self.last_fsync)
            .unwrap_or(Duration::ZERO);
        if elapsed.as_secs() >= self.config.fsync_interval_secs {
            self.fsync();
        }
    }

    /// `.N-1 → .N`, …, current → `.1`, then reopen a fresh current file.
    fn rotate(&mut self) {
        self.flush();
        self.file = None;
        let Some(base) = self.current_path().map(Path::to_path_buf) else {
            return;
        };

        let keep = self.config.max_rotated_files;
        let _ = fs::remove_file(rotated_name(&base, keep));
        for i in (1..keep).rev() {
            let _ = rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        if keep > 0 {
            let _ = rename(&base, rotated_name(&base, 1));
        } else {
            let _ = fs::remove_file(&base);
        }

        match open_append(&base) {
            Ok((file, _)) => {
                self.file = Some(BufWriter::with_capacity(64 * 1024, file));
                self.bytes_written = 0;
            }
            Err(_) => self.attach(next_level(self.state)),
        }
    }
}

const fn next_level(state: WriterState) -> WriterState {
    match state {
        WriterState::Primary => WriterState::Fallback,
        WriterState::Fallback => WriterState::Stderr,
        WriterState::Stderr | WriterState::Discard => WriterState::Discard,
    }
}

// ──────────────────────── helpers ────────────────────────

/// Open or create a file for appending. Returns `(File, current_size)`.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| DriftError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| DriftError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// `activity.jsonl` → `activity.jsonl.3`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
