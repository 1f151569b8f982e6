//! Signal handling: SIGTERM/SIGINT graceful shutdown, SIGHUP config reload
//! and reconcile, SIGUSR1 detect-all-now.
//!
//! `signal-hook` only flips atomic flags; the daemon loop polls them.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Signal state shared between the OS handlers and the daemon loop.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    reload_flag: Arc<AtomicBool>,
    detect_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Flags wired to the process signals. Registration failures are logged
    /// and otherwise ignored; the programmatic requests still work.
    pub fn install() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// Flags with no OS signals attached.
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            reload_flag: Arc::new(AtomicBool::new(false)),
            detect_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check and clear.
    pub fn should_reload(&self) -> bool {
        self.reload_flag.swap(false, Ordering::Relaxed)
    }

    /// Check and clear.
    pub fn should_detect(&self) -> bool {
        self.detect_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_detect(&self) {
        self.detect_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        let mut wiring = vec![
            (SIGTERM, "SIGTERM", &self.shutdown_flag),
            (SIGINT, "SIGINT", &self.shutdown_flag),
        ];
        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGHUP, SIGUSR1};
            wiring.push((SIGHUP, "SIGHUP", &self.reload_flag));
            wiring.push((SIGUSR1, "SIGUSR1", &self.detect_flag));
        }
        for (signal, name, flag) in wiring {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(flag)) {
                tracing::warn!(signal = name, error = %e, "failed to register signal handler");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handler_has_nothing_pending() {
        let handler = SignalHandler::unregistered();
        assert!(!handler.should_shutdown());
        assert!(!handler.should_reload());
        assert!(!handler.should_detect());
    }

    #[test]
    fn shutdown_is_sticky_across_clones() {
        let handler = SignalHandler::unregistered();
        let clone = handler.clone();
        handler.request_shutdown();
        assert!(clone.should_shutdown());
        assert!(clone.should_shutdown());
    }

    #[test]
    fn reload_and_detect_clear_on_read() {
        let handler = SignalHandler::unregistered();
        handler.request_reload();
        handler.request_detect();
        assert!(handler.should_reload());
        assert!(!handler.should_reload());
        assert!(handler.should_detect());
        assert!(!handler.should_detect());
    }

    #[cfg(unix)]
    #[test]
    fn sighup_sets_reload_flag() {
        let handler = SignalHandler::install();
        signal_hook::low_level::raise(signal_hook::consts::SIGHUP).unwrap();
        assert!(handler.should_reload());
    }
}
