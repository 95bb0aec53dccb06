//! The worker boundary.
//!
//! Mining hardware drivers talk to the dispatch engine through a
//! [`WorkerHandle`]: they request jobs for a chain, hand back candidate
//! solutions, and listen for notices telling them which jobs to abandon.

use tokio::sync::mpsc;

use crate::dispatch::{call, EngineCommand};
use crate::error::Result;
use crate::job_source::{Job, JobId, Solution, SubmitOutcome};

slotmap::new_key_type! {
    /// Engine-assigned identifier of a registered worker.
    pub struct WorkerId;
}

/// Instructions pushed to workers when outstanding jobs become useless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerNotice {
    /// Every job of `chain` minted before `generation` is stale.
    Invalidate { chain: String, generation: u64 },

    /// These jobs were revoked by the source that issued them.
    Revoke { jobs: Vec<JobId> },
}

/// A worker's connection to the dispatch engine.
///
/// Dropping the handle unregisters the worker.
pub struct WorkerHandle {
    id: WorkerId,
    commands: mpsc::Sender<EngineCommand>,
    notices: mpsc::Receiver<WorkerNotice>,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: WorkerId,
        commands: mpsc::Sender<EngineCommand>,
        notices: mpsc::Receiver<WorkerNotice>,
    ) -> Self {
        Self {
            id,
            commands,
            notices,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Ask for a job on `chain`.
    ///
    /// Waits while the chain has no usable source; callers that cannot wait
    /// indefinitely should wrap this in a timeout.
    pub async fn request_job(&self, chain: &str) -> Result<Job> {
        let worker = self.id;
        let chain = chain.to_string();
        call(&self.commands, |reply| EngineCommand::RequestJob {
            worker,
            chain,
            reply,
        })
        .await?
    }

    /// Hand in a solution for `job` and wait for its outcome.
    pub async fn submit_result(&self, job: &Job, solution: Solution) -> Result<SubmitOutcome> {
        let worker = self.id;
        let job = job.id;
        call(&self.commands, |reply| EngineCommand::SubmitResult {
            worker,
            job,
            solution,
            reply,
        })
        .await?
    }

    /// Wait for the next notice. Returns `None` once the engine has stopped.
    pub async fn next_notice(&mut self) -> Option<WorkerNotice> {
        self.notices.recv().await
    }

    /// Take a notice if one is already queued.
    pub fn try_notice(&mut self) -> Option<WorkerNotice> {
        self.notices.try_recv().ok()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.commands
            .try_send(EngineCommand::UnregisterWorker(self.id))
            .ok();
    }
}
