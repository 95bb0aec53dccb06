//! Per-chain freshness tracking.
//!
//! A [`ChainTracker`] holds the best block the daemon knows of for one
//! blockchain and a generation counter that advances with every new block.
//! Jobs are stamped with the generation current at mint time; a job is stale
//! once the generation has moved past it.

use std::collections::VecDeque;

use crate::job_source::{BlockInfo, Job};
use crate::types::{BlockHash, Target};

/// Number of recently seen previous-block hashes remembered for
/// de-duplication.
const RECENT_BLOCKS: usize = 16;

#[derive(Debug)]
pub struct ChainTracker {
    name: String,
    height: u64,
    target: Option<Target>,
    generation: u64,
    tip: Option<BlockHash>,
    recent: VecDeque<BlockHash>,
}

impl ChainTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            height: 0,
            target: None,
            generation: 0,
            tip: None,
            recent: VecDeque::with_capacity(RECENT_BLOCKS),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Best known height.
    ///
    /// Relative rather than absolute while only protocols without height
    /// information (getwork) have been observed.
    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn target(&self) -> Option<Target> {
        self.target
    }

    /// Previous-block hash of the newest block observed.
    pub fn tip(&self) -> Option<BlockHash> {
        self.tip
    }

    pub fn current_generation(&self) -> u64 {
        self.generation
    }

    /// Record a height report.
    ///
    /// Advances the height and the generation only if `height` is greater
    /// than the current height. Returns whether the generation advanced.
    pub fn observe_height(&mut self, height: u64) -> bool {
        if height <= self.height {
            return false;
        }
        self.height = height;
        self.generation += 1;
        true
    }

    /// Record the block a freshly issued template builds on.
    ///
    /// A previous-block hash seen before never advances the generation; if it
    /// is the current tip and carries a height, that height calibrates the
    /// tracker. A new hash without a height counts as one block past the
    /// current height. Returns whether the generation advanced.
    pub fn observe_block(&mut self, block: &BlockInfo) -> bool {
        if self.recent.contains(&block.prev_hash) {
            if let Some(height) = block.height {
                if self.tip == Some(block.prev_hash) && height > self.height {
                    self.height = height;
                }
            }
            return false;
        }

        if self.recent.len() == RECENT_BLOCKS {
            self.recent.pop_front();
        }
        self.recent.push_back(block.prev_hash);

        let height = block.height.unwrap_or(self.height + 1);
        if self.observe_height(height) {
            self.tip = Some(block.prev_hash);
            true
        } else {
            false
        }
    }

    /// Record the network target reported with new work.
    pub fn observe_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    /// Whether `job` was minted under an earlier generation of this chain.
    pub fn is_stale(&self, job: &Job) -> bool {
        job.chain == self.name && job.generation < self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_source::{HeaderWork, JobId, JobTemplate, WorkPayload};
    use crate::tree::NodeId;
    use bitcoin::hashes::Hash;
    use slotmap::KeyData;
    use std::sync::Arc;
    use test_case::test_case;

    fn hash(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    fn block(n: u8, height: Option<u64>) -> BlockInfo {
        BlockInfo {
            prev_hash: hash(n),
            height,
        }
    }

    fn job_at(generation: u64) -> Job {
        Job {
            id: JobId(1),
            chain: "Bitcoin".to_string(),
            generation,
            source: NodeId::from(KeyData::from_ffi(1)),
            template: Arc::new(JobTemplate {
                id: "1".to_string(),
                payload: WorkPayload::Header(HeaderWork { data: vec![0; 128] }),
                target: Target::MAX,
                epoch: 0,
                block: None,
            }),
            invalidated: false,
        }
    }

    #[test]
    fn test_higher_height_advances_generation() {
        let mut chain = ChainTracker::new("Bitcoin");
        assert!(chain.observe_height(100));
        assert_eq!(chain.height(), 100);
        assert_eq!(chain.current_generation(), 1);

        assert!(chain.observe_height(101));
        assert_eq!(chain.current_generation(), 2);
    }

    #[test_case(&[100, 100] ; "duplicate")]
    #[test_case(&[100, 99, 50] ; "decreasing")]
    #[test_case(&[100, 0, 100, 100] ; "mixed")]
    fn test_non_increasing_heights_are_idempotent(heights: &[u64]) {
        let mut chain = ChainTracker::new("Bitcoin");
        chain.observe_height(heights[0]);
        let generation = chain.current_generation();

        for &height in &heights[1..] {
            assert!(!chain.observe_height(height));
        }
        assert_eq!(chain.current_generation(), generation);
        assert_eq!(chain.height(), heights[0]);
    }

    #[test]
    fn test_new_block_without_height_counts_as_next() {
        let mut chain = ChainTracker::new("Bitcoin");
        assert!(chain.observe_block(&block(1, None)));
        assert!(chain.observe_block(&block(2, None)));
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.current_generation(), 2);
        assert_eq!(chain.tip(), Some(hash(2)));
    }

    #[test]
    fn test_repeated_block_does_not_advance() {
        let mut chain = ChainTracker::new("Bitcoin");
        assert!(chain.observe_block(&block(1, None)));
        assert!(!chain.observe_block(&block(1, None)));
        assert!(!chain.observe_block(&block(1, Some(800_000))));
        assert_eq!(chain.current_generation(), 1);
    }

    #[test]
    fn test_known_tip_calibrates_height() {
        let mut chain = ChainTracker::new("Bitcoin");
        chain.observe_block(&block(1, None));
        chain.observe_block(&block(1, Some(800_000)));
        assert_eq!(chain.height(), 800_000);
        assert_eq!(chain.current_generation(), 1);

        // The next block reported with its real height advances normally
        assert!(chain.observe_block(&block(2, Some(800_001))));
        assert_eq!(chain.current_generation(), 2);
    }

    #[test]
    fn test_lagging_block_with_height_is_ignored() {
        let mut chain = ChainTracker::new("Bitcoin");
        chain.observe_block(&block(2, Some(500)));
        assert!(!chain.observe_block(&block(1, Some(499))));
        assert_eq!(chain.tip(), Some(hash(2)));
        assert_eq!(chain.current_generation(), 1);
    }

    #[test]
    fn test_staleness_follows_generation() {
        let mut chain = ChainTracker::new("Bitcoin");
        chain.observe_height(5);
        let job = job_at(chain.current_generation());
        assert!(!chain.is_stale(&job));

        chain.observe_height(6);
        assert!(chain.is_stale(&job));
        assert!(!chain.is_stale(&job_at(chain.current_generation())));
    }

    #[test]
    fn test_other_chains_jobs_are_never_stale() {
        let mut chain = ChainTracker::new("Testnet");
        chain.observe_height(10);
        assert!(!chain.is_stale(&job_at(0)));
    }
}
