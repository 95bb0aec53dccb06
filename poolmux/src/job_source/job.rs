use std::fmt;
use std::sync::Arc;

use crate::tree::NodeId;
use crate::types::{BlockHash, CompactTarget, Target, TxMerkleNode, Version};

/// Work as delivered by a job source, before the engine mints a [`Job`].
///
/// Sources produce templates; only the engine assigns job ids and chain
/// generations, so a template carries nothing engine-specific beyond the
/// source's connection epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    /// Source-local job identifier (the pool's job id for Stratum, a counter
    /// for getwork).
    pub id: String,

    /// Protocol-specific work payload.
    pub payload: WorkPayload,

    /// Share target a solution must meet to be worth submitting.
    pub target: Target,

    /// Source epoch the template was issued under.
    ///
    /// A source advances its epoch on reconnect, long-poll, or `clean_jobs`.
    /// Solutions for a template from an older epoch are answered stale
    /// without contacting the upstream.
    pub epoch: u64,

    /// Block the work builds on, when the protocol reveals it.
    pub block: Option<BlockInfo>,
}

/// The block a template builds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub prev_hash: BlockHash,
    pub height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkPayload {
    /// Complete 80-byte header (plus SHA-256 padding) from a getwork pool.
    Header(HeaderWork),

    /// Coinbase parts and merkle path from a Stratum pool; the worker builds
    /// the header itself.
    Stratum(StratumWork),
}

#[derive(Clone, PartialEq, Eq)]
pub struct HeaderWork {
    /// Header data as sent by the pool, in getwork's word-swapped layout.
    pub data: Vec<u8>,
}

impl fmt::Debug for HeaderWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderWork")
            .field("data", &hex::encode(&self.data[..self.data.len().min(80)]))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StratumWork {
    pub prev_hash: BlockHash,
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<TxMerkleNode>,
    pub version: Version,
    /// Version bits the pool allows the worker to roll.
    pub version_mask: Option<u32>,
    pub nbits: CompactTarget,
    pub ntime: u32,
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
}

/// Engine-assigned job identifier, unique for the lifetime of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work handed to a worker.
///
/// Minted by the dispatch engine from a [`JobTemplate`]. Everything except
/// `invalidated` is fixed at mint time; workers receive copies, and the
/// engine keeps the authoritative flag.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub chain: String,
    /// Chain generation the job was minted under.
    pub generation: u64,
    /// Leaf that issued the template; solutions are routed back here.
    pub source: NodeId,
    pub template: Arc<JobTemplate>,
    pub invalidated: bool,
}

impl Job {
    pub fn target(&self) -> Target {
        self.template.target
    }

    pub fn epoch(&self) -> u64 {
        self.template.epoch
    }
}

/// Candidate solution found by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub nonce: u32,
    /// Rolled ntime, if the worker changed it.
    pub ntime: Option<u32>,
    /// Extranonce2 used (Stratum work only).
    pub extranonce2: Option<Vec<u8>>,
    /// Full rolled version, if the worker rolled version bits.
    pub version: Option<Version>,
}

impl Solution {
    pub fn with_nonce(nonce: u32) -> Self {
        Self {
            nonce,
            ntime: None,
            extranonce2: None,
            version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Pending,
    Accepted,
    Rejected(String),
    /// The job was superseded before the solution reached the upstream.
    Stale,
    Error(String),
}

impl SubmitOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmitOutcome::Pending)
    }
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitOutcome::Pending => write!(f, "pending"),
            SubmitOutcome::Accepted => write!(f, "accepted"),
            SubmitOutcome::Rejected(reason) => write!(f, "rejected ({})", reason),
            SubmitOutcome::Stale => write!(f, "stale"),
            SubmitOutcome::Error(reason) => write!(f, "error ({})", reason),
        }
    }
}

/// A solution on its way to the job's source.
///
/// Once an outcome other than `Pending` is recorded it never changes.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: SubmissionId,
    pub job: Job,
    pub solution: Solution,
    outcome: SubmitOutcome,
}

impl Submission {
    pub fn new(id: SubmissionId, job: Job, solution: Solution) -> Self {
        Self {
            id,
            job,
            solution,
            outcome: SubmitOutcome::Pending,
        }
    }

    pub fn outcome(&self) -> &SubmitOutcome {
        &self.outcome
    }

    /// Record the outcome. Returns false if one was already recorded.
    pub fn resolve(&mut self, outcome: SubmitOutcome) -> bool {
        if self.outcome.is_terminal() {
            return false;
        }
        self.outcome = outcome;
        true
    }
}
