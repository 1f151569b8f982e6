//! Daemon subsystem: the signal-driven main loop around the drift manager.

#[cfg(feature = "daemon")]
pub mod loop_main;
#[cfg(feature = "daemon")]
pub mod signals;
