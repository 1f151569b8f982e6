//! Directory scanning: parallel walker, include/exclude filters, SHA-256
//! content digests, and the snapshot analyzer that diffs against a baseline.

pub mod analyzer;
pub mod digest;
pub mod filter;
pub mod walker;
