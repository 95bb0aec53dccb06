//! Daemon lifecycle management for poolmux.
//!
//! This module starts the source tasks and the dispatch engine, reports
//! lifecycle events, handles signals, and drains the engine on shutdown.

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::dispatch::{DispatchHandle, Dispatcher, LifecycleEvent};
use crate::job_source::TaskSpawner;
use crate::tracing::prelude::*;

/// The main daemon.
pub struct Daemon {
    instance: String,
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new(instance: impl Into<String>, config: Config) -> Self {
        Self {
            instance: instance.into(),
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Start the engine and the lifecycle reporter.
    fn start(&self) -> anyhow::Result<DispatchHandle> {
        let spawner = TaskSpawner::new(self.tracker.clone(), self.shutdown.clone());
        let (handle, lifecycle) = Dispatcher::start(&self.config, Box::new(spawner))?;

        self.tracker
            .spawn(report_lifecycle(lifecycle, self.shutdown.clone()));
        Ok(handle)
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(instance = %self.instance, chains = self.config.chains.len(), "Starting.");
        let handle = self.start()?;

        info!("Started.");
        info!("For debugging, set RUST_LOG=poolmux=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        // Let outstanding submissions finish before the sources go away
        match handle.stop().await {
            Ok(stats) => {
                for (chain, stats) in stats.chains() {
                    info!(
                        chain = %chain,
                        accepted = stats.accepted,
                        rejected = stats.rejected,
                        stale = stats.stale,
                        lost = stats.lost,
                        "Final statistics."
                    );
                }
            }
            Err(e) => warn!(error = %e, "Dispatch engine did not drain"),
        }

        self.shutdown.cancel();
        self.tracker.close();

        // Wait for all tasks to complete
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

/// Log lifecycle events as the operator-facing record of failovers.
async fn report_lifecycle(
    mut events: mpsc::Receiver<LifecycleEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(LifecycleEvent::NoSourceAvailable { chain }) => {
                    error!(chain = %chain, "All work sources are down; retrying.");
                }
                Some(LifecycleEvent::SourceRestored { chain, source }) => {
                    info!(chain = %chain, source = %source, "Mining resumed.");
                }
                Some(LifecycleEvent::Failover { chain, from, to }) => {
                    warn!(chain = %chain, from = %from, to = %to, "Switched work source.");
                }
                Some(LifecycleEvent::AuthFailed { source, reason }) => {
                    error!(
                        source = %source,
                        reason = %reason,
                        "Check the credentials of this work source; it stays down until they are changed."
                    );
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
}
