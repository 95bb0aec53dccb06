//! Stratum v1 protocol client.
//!
//! Wire types, the line-delimited JSON transport, and a client that runs a
//! single pool session and reports what happens on it as [`ClientEvent`]s.
//! The push job source in [`crate::job_source::stratum_v1`] drives
//! reconnects and maps events onto the dispatch engine's vocabulary.

mod client;
mod connection;
mod error;
mod messages;

pub use client::{PoolConfig, StratumV1Client};
pub use connection::Connection;
pub use error::{StratumError, StratumResult};
pub use messages::{
    parse_error, ClientCommand, ClientEvent, JobNotification, JsonRpcMessage, SubmitParams,
};

/// Stratum error code for "job not found", which pools send for shares
/// on jobs they have already discarded.
pub const JOB_NOT_FOUND: i64 = 21;
