//! Daemon loop: builds the drift manager from configuration, runs the
//! detector workers, and reacts to signals.
//!
//! Threads: the main thread (this loop, polling signal flags), N detector
//! workers owned by the manager, and the journal thread fed through a
//! bounded crossbeam channel.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::signals::SignalHandler;
use crate::drift::manager::{DriftManager, ReconcileReport};
use crate::drift::transport::{DriftClient, DriftServer, FileSystemClient, SpoolServer};
use crate::logger::journal::{ActivityEvent, JournalConfig, JournalHandle, spawn_journal};
use crate::logger::jsonl::JsonlConfig;

/// How often the main loop checks the signal flags.
const SIGNAL_POLL: Duration = Duration::from_millis(200);

pub struct DriftDaemon {
    config: Config,
    manager: DriftManager,
    journal: JournalHandle,
    journal_join: Option<thread::JoinHandle<()>>,
    signals: SignalHandler,
    start_time: Instant,
}

impl DriftDaemon {
    /// Wire the daemon with the spool transport and filesystem client.
    pub fn init(config: Config, signals: SignalHandler) -> Result<Self> {
        let server = Arc::new(SpoolServer::new(&config.transport.outbox_dir)?);
        Self::with_transport(config, signals, server, Arc::new(FileSystemClient::new()))
    }

    /// Wire the daemon with caller-provided collaborators.
    pub fn with_transport(
        config: Config,
        signals: SignalHandler,
        server: Arc<dyn DriftServer>,
        client: Arc<dyn DriftClient>,
    ) -> Result<Self> {
        let journal_config = JournalConfig {
            jsonl: JsonlConfig::at(&config.paths.journal_log),
            channel_capacity: config.agent.journal_channel_capacity,
        };
        let (journal, journal_join) = spawn_journal(journal_config)?;
        let manager = DriftManager::new(config.manager_config(), server, client, journal.clone())?;

        Ok(Self {
            config,
            manager,
            journal,
            journal_join: Some(journal_join),
            signals,
            start_time: Instant::now(),
        })
    }

    pub fn manager(&self) -> &DriftManager {
        &self.manager
    }

    pub fn signals(&self) -> SignalHandler {
        self.signals.clone()
    }

    /// Run until a shutdown is requested. This is the body of `driftd daemon`.
    pub fn run(&mut self) -> Result<()> {
        let report = self.manager.reconcile(&self.config.desired_definitions())?;
        let schedules = self.manager.queue().len();
        self.journal.send(ActivityEvent::AgentStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: self.config.stable_hash().unwrap_or_default(),
            schedules,
        });
        tracing::info!(
            schedules,
            orphans_purged = report.orphans_purged,
            data_dir = %self.config.agent.data_dir.display(),
            "driftd starting"
        );

        if let Err(err) = self.manager.start(self.config.agent.worker_threads) {
            self.stop("startup failure");
            return Err(err);
        }

        while !self.signals.should_shutdown() {
            if self.signals.should_reload() {
                self.handle_config_reload();
            }
            if self.signals.should_detect() {
                let count = self.manager.detect_all_now();
                tracing::info!(schedules = count, "immediate detection requested");
            }
            thread::sleep(SIGNAL_POLL);
        }

        self.stop("clean shutdown");
        Ok(())
    }

    /// Re-read the config file and reconcile the schedules against it. A bad
    /// file leaves the running configuration in place.
    fn handle_config_reload(&mut self) {
        tracing::info!(path = %self.config.paths.config_file.display(), "config reload requested");
        let new_config = match Config::load(Some(&self.config.paths.config_file)) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::error!(error = %err, "config reload failed; keeping current config");
                self.journal.send(ActivityEvent::error(&err));
                return;
            }
        };

        if new_config.agent != self.config.agent
            || new_config.scanner != self.config.scanner
            || new_config.transport != self.config.transport
        {
            tracing::warn!("agent, scanner and transport settings take effect after a restart");
        }

        match self.manager.reconcile(&new_config.desired_definitions()) {
            Ok(report) => {
                self.journal.send(ActivityEvent::ConfigReloaded {
                    details: reload_details(&self.config, &new_config, &report),
                });
                self.config = new_config;
            }
            Err(err) => {
                tracing::error!(error = %err, "reconcile after reload failed");
                self.journal.send(ActivityEvent::error(&err));
            }
        }
    }

    fn stop(&mut self, reason: &str) {
        self.manager.shutdown();
        let uptime_secs = self.start_time.elapsed().as_secs();
        self.journal.send(ActivityEvent::AgentStopped {
            reason: reason.to_string(),
            uptime_secs,
        });
        self.journal.shutdown();
        if let Some(join) = self.journal_join.take() {
            let _ = join.join();
        }
        tracing::info!(uptime_secs, reason, "driftd stopped");
    }
}

impl Drop for DriftDaemon {
    fn drop(&mut self) {
        if self.journal_join.is_some() {
            self.stop("dropped");
        }
    }
}

fn reload_details(old: &Config, new: &Config, report: &ReconcileReport) -> String {
    format!(
        "config hash {} -> {}; scheduled {}, updated {}, unscheduled {}",
        old.stable_hash().unwrap_or_default(),
        new.stable_hash().unwrap_or_default(),
        report.scheduled,
        report.updated,
        report.unscheduled
    )
}
