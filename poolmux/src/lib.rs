//! Work-source failover tree and job dispatch engine for mining daemons.
//!
//! Upstream pools are arranged in a priority tree per blockchain. The
//! [`dispatch`] engine picks the best live source, hands its work to
//! registered workers, routes their solutions back to the source that issued
//! the work, and marks work stale when the chain moves on.

pub mod backoff;
pub mod chain;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod job_source;
pub mod stratum_v1;
pub mod tracing;
pub mod tree;
pub mod types;
pub mod worker;
