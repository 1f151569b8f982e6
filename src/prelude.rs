//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use drift_agent::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{DriftError, Result};

// Scanner
pub use crate::scanner::analyzer::{DiffResult, DirectoryAnalyzer, Snapshot};
pub use crate::scanner::digest::Digest;
pub use crate::scanner::filter::FilterSet;
pub use crate::scanner::walker::{DirectoryWalker, WalkerConfig};

// Drift
pub use crate::drift::changeset::{Category, ChangeType, DirectoryEntry, FileEntry, Header};
pub use crate::drift::codec::{ChangeSetReader, ChangeSetWriter};
pub use crate::drift::coordinator::DriftCoordinator;
pub use crate::drift::definition::{
    BaseDirContext, BaseDirectory, DriftDefinition, Filter, ResourceId, ScheduleKey,
};
pub use crate::drift::detector::{DetectionOutcome, DriftDetector};
pub use crate::drift::manager::{DriftManager, ManagerConfig};
pub use crate::drift::store::ChangeSetStore;
pub use crate::drift::transport::{DriftClient, DriftServer, FileSystemClient, SpoolServer};
