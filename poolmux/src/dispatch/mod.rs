//! The dispatch engine.
//!
//! One task owns the source tree, the chain trackers, every outstanding job
//! and every pending submission. Workers, the lifecycle controller and the
//! source tasks reach it only through channels, so selection, minting and
//! invalidation are serialized without locks.
//!
//! # Per-chain states
//!
//! - **Idle**: no usable cached job and no fetch in flight
//! - **Fetching**: a fetch to the active leaf is in flight
//! - **Distributing**: a cached job is handed to idle workers until its
//!   reuse count runs out or it is invalidated
//! - **Draining**: shutdown in progress; no new fetches, outstanding
//!   submissions still complete
//!
//! # Failover
//!
//! The active leaf of a chain is re-selected whenever a leaf's liveness
//! changes, a fetch fails, the tree is edited, and on a periodic health
//! check. A switch stops hand-outs of the previous leaf's cached job but
//! never touches jobs already dispatched: solutions for them are still
//! routed to the leaf that issued them.

mod engine;
mod stats;

pub use stats::{ChainStats, DispatchStats};

use tokio::sync::{mpsc, oneshot};

use crate::config::{Config, GroupSettings, NodeConfig, SourceConfig};
use crate::error::{DispatchError, Result};
use crate::job_source::{Job, JobId, Solution, SourceSpawner, SubmitOutcome};
use crate::tree::{NodeId, NodeSnapshot};
use crate::worker::{WorkerHandle, WorkerId, WorkerNotice};

use engine::Engine;

const COMMAND_CAPACITY: usize = 256;
const LIFECYCLE_CAPACITY: usize = 64;

/// Hot-applied settings for one node.
#[derive(Debug, Clone)]
pub enum NodeSettings {
    Group(GroupSettings),
    Source(SourceConfig),
}

/// Events surfaced to the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Every source of the chain failed; the engine keeps retrying.
    NoSourceAvailable { chain: String },

    /// Work flows again after `NoSourceAvailable`.
    SourceRestored { chain: String, source: String },

    /// The active leaf changed.
    Failover {
        chain: String,
        from: String,
        to: String,
    },

    /// A source's credentials were rejected; it stays down until its
    /// settings are applied again.
    AuthFailed { source: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Idle,
    Fetching,
    Distributing,
    Draining,
}

/// Point-in-time view of one chain.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub name: String,
    pub height: u64,
    pub generation: u64,
    pub phase: ChainPhase,
    pub active: Option<NodeId>,
    /// Workers waiting for a job
    pub waiting: usize,
    pub root: NodeSnapshot,
}

pub(crate) enum EngineCommand {
    RegisterWorker {
        reply: oneshot::Sender<(WorkerId, mpsc::Receiver<WorkerNotice>)>,
    },
    UnregisterWorker(WorkerId),
    RequestJob {
        worker: WorkerId,
        chain: String,
        reply: oneshot::Sender<Result<Job>>,
    },
    SubmitResult {
        worker: WorkerId,
        job: JobId,
        solution: Solution,
        reply: oneshot::Sender<Result<SubmitOutcome>>,
    },
    ApplySettings {
        node: NodeId,
        settings: NodeSettings,
        reply: oneshot::Sender<Result<()>>,
    },
    AddNode {
        parent: NodeId,
        config: NodeConfig,
        reply: oneshot::Sender<Result<NodeId>>,
    },
    RemoveNode {
        node: NodeId,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ChainSnapshot>>,
    },
    Stop {
        reply: oneshot::Sender<DispatchStats>,
    },
}

/// Send a command carrying a reply channel and wait for the answer.
pub(crate) async fn call<T>(
    commands: &mpsc::Sender<EngineCommand>,
    make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(make(reply))
        .await
        .map_err(|_| DispatchError::EngineStopped)?;
    rx.await.map_err(|_| DispatchError::EngineStopped)
}

pub struct Dispatcher;

impl Dispatcher {
    /// Build the source tree, spawn a task per leaf and start the engine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &Config,
        spawner: Box<dyn SourceSpawner>,
    ) -> Result<(DispatchHandle, mpsc::Receiver<LifecycleEvent>)> {
        config
            .validate()
            .map_err(|e| DispatchError::InvalidSettings(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(LIFECYCLE_CAPACITY);

        let engine = Engine::new(config, spawner, command_rx, event_tx)?;
        tokio::spawn(engine.run());

        Ok((
            DispatchHandle {
                commands: command_tx,
            },
            event_rx,
        ))
    }
}

/// Lifecycle controller's handle on a running engine.
#[derive(Clone)]
pub struct DispatchHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl DispatchHandle {
    pub async fn register_worker(&self) -> Result<WorkerHandle> {
        let (id, notices) = call(&self.commands, |reply| EngineCommand::RegisterWorker {
            reply,
        })
        .await?;
        Ok(WorkerHandle::new(id, self.commands.clone(), notices))
    }

    /// Hot-swap one node's settings.
    pub async fn apply_settings(&self, node: NodeId, settings: NodeSettings) -> Result<()> {
        call(&self.commands, |reply| EngineCommand::ApplySettings {
            node,
            settings,
            reply,
        })
        .await?
    }

    /// Add a subtree below `parent`; its sources start at once.
    pub async fn add_node(&self, parent: NodeId, config: NodeConfig) -> Result<NodeId> {
        call(&self.commands, |reply| EngineCommand::AddNode {
            parent,
            config,
            reply,
        })
        .await?
    }

    /// Remove a subtree and stop its sources.
    pub async fn remove_node(&self, node: NodeId) -> Result<()> {
        call(&self.commands, |reply| EngineCommand::RemoveNode { node, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<Vec<ChainSnapshot>> {
        call(&self.commands, |reply| EngineCommand::Snapshot { reply }).await
    }

    /// Drain and stop the engine.
    ///
    /// Returns once outstanding fetches and submissions have completed or
    /// their drain deadlines have passed.
    pub async fn stop(self) -> Result<DispatchStats> {
        call(&self.commands, |reply| EngineCommand::Stop { reply }).await
    }
}
