use std::collections::BTreeMap;
use std::time::Instant;

use crate::tracing::prelude::*;

/// Counters for one chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainStats {
    /// Jobs handed to workers
    pub jobs: u64,

    pub fetches: u64,

    pub fetch_failures: u64,

    pub accepted: u64,

    pub rejected: u64,

    /// Solutions for superseded work (wasted, not an error)
    pub stale: u64,

    pub errors: u64,

    /// Submissions still unanswered when shutdown gave up on them
    pub lost: u64,

    pub failovers: u64,

    /// Generation advances
    pub blocks: u64,

    /// Jobs revoked by their source
    pub revoked: u64,

    /// Times the chain ran out of usable sources
    pub exhausted: u64,
}

/// Dispatch statistics, returned when the engine stops.
#[derive(Debug, Clone)]
pub struct DispatchStats {
    start_time: Instant,
    chains: BTreeMap<String, ChainStats>,
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            chains: BTreeMap::new(),
        }
    }
}

impl DispatchStats {
    pub fn chain(&self, name: &str) -> Option<&ChainStats> {
        self.chains.get(name)
    }

    pub fn chains(&self) -> impl Iterator<Item = (&str, &ChainStats)> {
        self.chains.iter().map(|(name, stats)| (name.as_str(), stats))
    }

    pub(crate) fn chain_mut(&mut self, name: &str) -> &mut ChainStats {
        self.chains.entry(name.to_string()).or_default()
    }

    pub fn log_summary(&self) {
        let uptime_s = self.start_time.elapsed().as_secs();
        if self.chains.is_empty() {
            info!(uptime_s, "Dispatch status.");
            return;
        }

        for (chain, stats) in &self.chains {
            info!(
                uptime_s,
                chain = %chain,
                jobs = stats.jobs,
                accepted = stats.accepted,
                rejected = stats.rejected,
                stale = stats.stale,
                errors = stats.errors,
                lost = stats.lost,
                failovers = stats.failovers,
                "Dispatch status."
            );
        }
    }
}
