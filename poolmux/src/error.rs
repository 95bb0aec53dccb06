//! Error types shared across the engine and its job sources.

use thiserror::Error;

/// Failure reported by a job source for a fetch or submission.
///
/// Transport and protocol errors are absorbed by the source's own retry and
/// failure threshold. Authentication errors are never retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::Auth(_))
    }
}

/// Errors returned by the dispatch engine's public handles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown chain: {0}")]
    UnknownChain(String),

    #[error("unknown node")]
    UnknownNode,

    #[error("unknown job")]
    UnknownJob,

    #[error("invalid topology change: {0}")]
    InvalidTopology(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("dispatch engine is draining")]
    ShuttingDown,

    #[error("dispatch engine has stopped")]
    EngineStopped,
}

pub type Result<T> = std::result::Result<T, DispatchError>;
