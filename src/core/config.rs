//! Configuration system: TOML file + env var overrides + defaults.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DriftError, Result};
use crate::core::paths::{absolutize, trim_trailing_separator};
use crate::drift::definition::{DriftDefinition, ResourceId};
use crate::drift::manager::ManagerConfig;
use crate::scanner::analyzer::AnalyzerConfig;

/// Full driftd configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub scanner: ScannerConfig,
    pub transport: TransportConfig,
    pub paths: PathsConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub definitions: Vec<DefinitionConfig>,
}

/// Worker pool and on-disk state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    pub worker_threads: usize,
    /// Longest a parked worker sleeps before re-checking the queue.
    pub idle_poll_ms: u64,
    /// Capacity of the journal channel; events beyond it are dropped.
    pub journal_channel_capacity: usize,
}

/// Directory walk behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerConfig {
    pub follow_symlinks: bool,
    pub max_depth: usize,
    pub parallelism: usize,
}

/// Where bundles are handed off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    pub outbox_dir: PathBuf,
}

/// Filesystem paths used by driftd.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub journal_log: PathBuf,
}

/// One `[[definitions]]` entry: a drift definition bound to a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefinitionConfig {
    pub resource_id: ResourceId,
    #[serde(flatten)]
    pub definition: DriftDefinition,
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || {
            eprintln!("[DRIFT-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
            PathBuf::from("/tmp")
        },
        PathBuf::from,
    )
}

fn data_root() -> PathBuf {
    home_dir().join(".local").join("share").join("driftd")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: data_root().join("changesets"),
            worker_threads: 2,
            idle_poll_ms: 1_000,
            journal_channel_capacity: 1_024,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            max_depth: 64,
            parallelism: 4,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbox_dir: data_root().join("outbox"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_file: home_dir().join(".config").join("driftd").join("config.toml"),
            journal_log: data_root().join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |name| env::var(name).ok())
    }

    fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|e| DriftError::io(&path_buf, e))?;
            Self::parse(&raw)?
        } else if path.is_some() {
            return Err(DriftError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(lookup)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML without overrides or validation.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON so the value is stable across
    /// processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Render as TOML (for `driftd config`).
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            follow_symlinks: self.scanner.follow_symlinks,
            max_depth: self.scanner.max_depth,
            parallelism: self.scanner.parallelism,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            data_dir: self.agent.data_dir.clone(),
            worker_threads: self.agent.worker_threads,
            idle_poll: Duration::from_millis(self.agent.idle_poll_ms),
            analyzer: self.analyzer_config(),
        }
    }

    /// Configured definitions as `(resource, definition)` pairs.
    pub fn desired_definitions(&self) -> Vec<(ResourceId, DriftDefinition)> {
        self.definitions
            .iter()
            .map(|d| (d.resource_id, d.definition.clone()))
            .collect()
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut var = |name: &str| lookup(name).filter(|raw| !raw.trim().is_empty());

        if let Some(raw) = var("DRIFTD_DATA_DIR") {
            self.agent.data_dir = PathBuf::from(raw);
        }
        set_usize(&mut var, "DRIFTD_WORKER_THREADS", &mut self.agent.worker_threads)?;
        set_u64(&mut var, "DRIFTD_IDLE_POLL_MS", &mut self.agent.idle_poll_ms)?;
        set_usize(
            &mut var,
            "DRIFTD_JOURNAL_CHANNEL_CAPACITY",
            &mut self.agent.journal_channel_capacity,
        )?;

        set_bool(
            &mut var,
            "DRIFTD_SCANNER_FOLLOW_SYMLINKS",
            &mut self.scanner.follow_symlinks,
        )?;
        set_usize(&mut var, "DRIFTD_SCANNER_MAX_DEPTH", &mut self.scanner.max_depth)?;
        set_usize(
            &mut var,
            "DRIFTD_SCANNER_PARALLELISM",
            &mut self.scanner.parallelism,
        )?;

        if let Some(raw) = var("DRIFTD_OUTBOX_DIR") {
            self.transport.outbox_dir = PathBuf::from(raw);
        }
        if let Some(raw) = var("DRIFTD_JOURNAL_LOG") {
            self.paths.journal_log = PathBuf::from(raw);
        }
        Ok(())
    }

    /// Absolute, lexically folded directories; basedir values without a
    /// trailing slash.
    fn normalize_paths(&mut self) {
        self.agent.data_dir = absolutize(&self.agent.data_dir);
        self.transport.outbox_dir = absolutize(&self.transport.outbox_dir);
        self.paths.journal_log = absolutize(&self.paths.journal_log);
        for def in &mut self.definitions {
            let value = &mut def.definition.basedir.value;
            *value = trim_trailing_separator(value).to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.agent.worker_threads == 0 {
            return Err(DriftError::InvalidConfig {
                details: "agent.worker_threads must be >= 1".to_string(),
            });
        }
        if self.agent.idle_poll_ms == 0 {
            return Err(DriftError::InvalidConfig {
                details: "agent.idle_poll_ms must be >= 1".to_string(),
            });
        }
        if self.agent.journal_channel_capacity == 0 {
            return Err(DriftError::InvalidConfig {
                details: "agent.journal_channel_capacity must be >= 1".to_string(),
            });
        }
        if self.scanner.parallelism == 0 {
            return Err(DriftError::InvalidConfig {
                details: "scanner.parallelism must be >= 1".to_string(),
            });
        }
        if self.scanner.max_depth == 0 {
            return Err(DriftError::InvalidConfig {
                details: "scanner.max_depth must be >= 1".to_string(),
            });
        }
        if self.agent.data_dir.as_os_str().is_empty() {
            return Err(DriftError::InvalidConfig {
                details: "agent.data_dir must not be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for entry in &self.definitions {
            entry.definition.validate().map_err(|err| match err {
                DriftError::InvalidDefinition { details } => DriftError::InvalidConfig {
                    details: format!("definitions (resource {}): {details}", entry.resource_id),
                },
                other => other,
            })?;
            if !seen.insert((entry.resource_id, entry.definition.name.as_str())) {
                return Err(DriftError::InvalidConfig {
                    details: format!(
                        "duplicate definition {:?} for resource {}",
                        entry.definition.name, entry.resource_id
                    ),
                });
            }
        }
        Ok(())
    }
}

fn set_u64<F>(var: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *slot = raw.trim().parse::<u64>().map_err(|error| DriftError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_usize<F>(var: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *slot = raw.trim().parse::<usize>().map_err(|error| DriftError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_bool<F>(var: &mut F, name: &str, slot: &mut bool) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *slot = raw.trim().parse::<bool>().map_err(|error| DriftError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}
