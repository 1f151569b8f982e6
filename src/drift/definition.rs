//! Drift definitions and per-resource detection schedules.

#![allow(missing_docs)]

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{DriftError, Result};
use crate::scanner::filter::validate_filter;

/// Identity of a monitored resource, assigned by the surrounding agent.
pub type ResourceId = u32;

/// Where a definition's basedir value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BaseDirContext {
    /// The value is a filesystem path.
    FileSystem,
    /// The value names a plugin configuration property of the resource.
    PluginConfiguration,
    /// The value names a resource configuration property.
    ResourceConfiguration,
    /// The value names a measurement trait of the resource.
    MeasurementTrait,
}

/// Logical base directory of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseDirectory {
    #[serde(default = "default_context")]
    pub context: BaseDirContext,
    pub value: String,
}

fn default_context() -> BaseDirContext {
    BaseDirContext::FileSystem
}

impl BaseDirectory {
    pub fn file_system(path: impl Into<String>) -> Self {
        Self {
            context: BaseDirContext::FileSystem,
            value: path.into(),
        }
    }
}

/// A directory path (relative to the basedir) plus an optional glob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Filter {
    pub fn new(path: impl Into<String>, pattern: Option<&str>) -> Self {
        Self {
            path: path.into(),
            pattern: pattern.map(str::to_string),
        }
    }
}

/// Immutable-per-version configuration of what to watch and how often.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriftDefinition {
    pub name: String,
    pub basedir: BaseDirectory,
    /// Scan period in seconds.
    pub interval_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<Filter>,
}

fn default_enabled() -> bool {
    true
}

impl DriftDefinition {
    pub fn new(name: impl Into<String>, basedir: BaseDirectory, interval: Duration) -> Self {
        Self {
            name: name.into(),
            basedir,
            interval_secs: interval.as_secs(),
            enabled: true,
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Reject definitions that could not be scanned or encoded.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DriftError::InvalidDefinition {
                details: "definition name must not be empty".to_string(),
            });
        }
        if self.name.contains(['\n', '\r']) {
            return Err(DriftError::InvalidDefinition {
                details: format!("definition name must be a single line: {:?}", self.name),
            });
        }
        if self.basedir.value.trim().is_empty() || self.basedir.value.contains(['\n', '\r']) {
            return Err(DriftError::InvalidDefinition {
                details: format!("definition {:?} has an unusable basedir", self.name),
            });
        }
        if self.interval_secs == 0 {
            return Err(DriftError::InvalidDefinition {
                details: format!("definition {:?} interval must be >= 1 second", self.name),
            });
        }
        for filter in self.includes.iter().chain(&self.excludes) {
            validate_filter(filter)?;
        }
        Ok(())
    }
}

/// `(resourceId, definitionName)`: identity of a schedule and of its
/// on-disk change-set directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleKey {
    pub resource_id: ResourceId,
    pub definition_name: String,
}

impl ScheduleKey {
    pub fn new(resource_id: ResourceId, definition_name: impl Into<String>) -> Self {
        Self {
            resource_id,
            definition_name: definition_name.into(),
        }
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.definition_name)
    }
}

/// Lifecycle of a schedule. A removed schedule is simply no longer held by
/// the queue, so there is no variant for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// Waiting in the queue for its next scan.
    Queued,
    /// Popped by a worker; a scan is in flight.
    Active,
    /// Unscheduled while its scan was in flight. The change-set directory is
    /// purged when the worker deactivates it.
    PendingRemoval,
}

/// Mutable scheduling record pairing a resource with a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftDetectionSchedule {
    pub resource_id: ResourceId,
    pub definition: DriftDefinition,
    pub next_scan: DateTime<Utc>,
    pub state: ScheduleState,
}

impl DriftDetectionSchedule {
    /// A new schedule, due immediately.
    pub fn new(resource_id: ResourceId, definition: DriftDefinition) -> Self {
        Self::due_at(resource_id, definition, Utc::now())
    }

    pub fn due_at(
        resource_id: ResourceId,
        definition: DriftDefinition,
        next_scan: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_id,
            definition,
            next_scan,
            state: ScheduleState::Queued,
        }
    }

    pub fn key(&self) -> ScheduleKey {
        ScheduleKey::new(self.resource_id, self.definition.name.clone())
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ScheduleState::Active | ScheduleState::PendingRemoval
        )
    }

    pub fn matches(&self, resource_id: ResourceId, definition_name: &str) -> bool {
        self.resource_id == resource_id && self.definition.name == definition_name
    }

    /// `next_scan = now + interval`.
    pub fn reschedule_from(&mut self, now: DateTime<Utc>) {
        let interval = chrono::Duration::from_std(self.definition.interval())
            .unwrap_or(chrono::Duration::MAX);
        self.next_scan = now.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}
