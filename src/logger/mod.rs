//! Logging: `tracing` diagnostics on stderr plus the JSONL activity journal.

pub mod diagnostics;
pub mod journal;
pub mod jsonl;
