use std::sync::Arc;

use tokio::sync::mpsc;

use super::job::{JobTemplate, Submission, SubmissionId, SubmitOutcome};
use super::Liveness;
use crate::config::SourceConfig;
use crate::error::SourceError;

/// Correlates a fetch request with its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchId(pub u64);

/// Commands from the dispatch engine to a source task.
#[derive(Debug)]
pub enum SourceCommand {
    /// Produce a job. Answered with `Work { request: Some(id) }` or
    /// `FetchFailed`.
    Fetch(FetchId),

    /// Submit a solution. Always answered with `SubmitResult`.
    Submit(Submission),

    /// Replace the source's configuration snapshot.
    Reconfigure(Arc<SourceConfig>),
}

/// Events from a source task to the dispatch engine.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A job template, either answering a fetch or pushed unsolicited.
    Work {
        request: Option<FetchId>,
        template: Arc<JobTemplate>,
    },

    FetchFailed {
        request: FetchId,
        error: SourceError,
    },

    Liveness(Liveness),

    /// Every template issued under an earlier epoch is void.
    EpochAdvanced(u64),

    SubmitResult {
        submission: SubmissionId,
        outcome: SubmitOutcome,
    },

    /// Credentials were rejected; the source stops until reconfigured.
    AuthFailed(String),
}

/// Channels connecting the engine to one source task.
pub struct SourceRegistration {
    /// Source name for logging
    pub name: String,

    pub event_rx: mpsc::Receiver<SourceEvent>,

    pub command_tx: mpsc::Sender<SourceCommand>,
}

/// Starts source tasks on behalf of the engine.
///
/// The engine calls this whenever a leaf is added to the tree. The daemon
/// spawns real protocol clients; tests substitute scripted sources.
pub trait SourceSpawner: Send {
    fn spawn(&mut self, config: Arc<SourceConfig>) -> SourceRegistration;
}
