//! Job source implementations.
//!
//! A job source is a leaf of the source tree: one connection to one upstream
//! pool. Two protocol families are supported:
//!
//! - **Poll**: periodic getwork requests over HTTP, with an optional
//!   long-poll side channel that signals new blocks ([`poll`], [`getwork`])
//! - **Push**: a persistent Stratum v1 subscription where the pool pushes
//!   jobs and acknowledges submissions asynchronously ([`stratum_v1`])
//!
//! # Architecture
//!
//! Sources are **active async tasks** that exchange messages with the
//! dispatch engine. The engine sends [`SourceCommand`]s (fetch, submit,
//! reconfigure); the source answers with [`SourceEvent`]s and also reports
//! liveness changes and epoch changes on its own initiative. A source never
//! touches engine state, and the engine never touches connection state.
//!
//! ## Epochs
//!
//! Every source keeps a connection epoch. It advances whenever previously
//! issued work becomes meaningless upstream: a Stratum reconnect (server job
//! ids are not stable across sessions), a `clean_jobs` notification, or a
//! getwork long-poll response. Templates carry the epoch they were issued
//! under, and a solution for an older epoch is answered
//! [`SubmitOutcome::Stale`] by the source itself without a round trip.

pub mod getwork;
mod job;
mod messages;
pub mod poll;
mod spawner;
pub mod stratum_v1;

pub use job::{
    BlockInfo, HeaderWork, Job, JobId, JobTemplate, Solution, StratumWork, Submission,
    SubmissionId, SubmitOutcome, WorkPayload,
};
pub use messages::{FetchId, SourceCommand, SourceEvent, SourceRegistration, SourceSpawner};
pub use spawner::TaskSpawner;

use std::fmt;

/// Reachability of a source (or, aggregated, of a group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Liveness {
    /// Not yet known to work or to have failed.
    #[default]
    Unknown,
    Alive,
    Dead,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Unknown => write!(f, "unknown"),
            Liveness::Alive => write!(f, "alive"),
            Liveness::Dead => write!(f, "dead"),
        }
    }
}
