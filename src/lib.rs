#![forbid(unsafe_code)]

//! drift_agent: agent-side drift detection.
//!
//! The agent periodically scans monitored directory trees, fingerprints file
//! content with SHA-256, and compares each snapshot with the last reported
//! one. Differences become change-sets in a line-oriented text format that
//! are bundled and handed to a server; the server acknowledges them and the
//! agent cleans up.
//!
//! 1. **Scanner**: parallel walker, include/exclude filters, digests
//! 2. **Drift**: change-set codec, store, schedule queue, detector, coordinator
//! 3. **Daemon**: signal-driven loop around [`drift::manager::DriftManager`]
//!
//! # Library usage
//!
//! ```rust,no_run
//! use drift_agent::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use drift_agent::drift::codec::ChangeSetReader;
//! use drift_agent::scanner::analyzer::{DirectoryAnalyzer, Snapshot};
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod drift;
pub mod logger;
pub mod scanner;
