use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::getwork::GetworkClient;
use super::poll::{PollProtocol, PollSource, ProtocolFactory};
use super::stratum_v1::StratumV1Source;
use super::{SourceRegistration, SourceSpawner};
use crate::config::{Protocol, SourceConfig};
use crate::error::SourceError;

const EVENT_CAPACITY: usize = 100;
const COMMAND_CAPACITY: usize = 32;

/// Spawns real protocol clients on the daemon's task tracker.
pub struct TaskSpawner {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskSpawner {
    pub fn new(tracker: TaskTracker, shutdown: CancellationToken) -> Self {
        Self { tracker, shutdown }
    }
}

fn getwork_factory() -> ProtocolFactory {
    Arc::new(
        |config: &SourceConfig| -> Result<Arc<dyn PollProtocol>, SourceError> {
            Ok(Arc::new(GetworkClient::new(config)?))
        },
    )
}

impl SourceSpawner for TaskSpawner {
    fn spawn(&mut self, config: Arc<SourceConfig>) -> SourceRegistration {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let name = config.name.clone();
        // Each source stops with the daemon or when the engine drops it
        let shutdown = self.shutdown.child_token();

        match config.protocol {
            Protocol::Getwork => {
                let source =
                    PollSource::new(config, getwork_factory(), command_rx, event_tx, shutdown);
                self.tracker.spawn(source.run());
            }
            Protocol::Stratum => {
                let source = StratumV1Source::new(config, command_rx, event_tx, shutdown);
                self.tracker.spawn(source.run());
            }
        }

        SourceRegistration {
            name,
            event_rx,
            command_tx,
        }
    }
}
