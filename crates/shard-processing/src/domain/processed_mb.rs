//! Cross-shard miniblocks already executed, grouped by the metachain header
//! that confirmed them.

use serde::{Deserialize, Serialize};
use shared_types::Hash;
use std::collections::{BTreeMap, BTreeSet};

/// Persisted form of one tracker entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniBlocksInMeta {
    pub meta_hash: Hash,
    pub mini_blocks_hashes: Vec<Hash>,
}

/// Metachain header hash to executed miniblock hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedMiniBlockTracker {
    processed: BTreeMap<Hash, BTreeSet<Hash>>,
}

impl ProcessedMiniBlockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mini_block_hash(&mut self, meta_hash: Hash, mini_block_hash: Hash) {
        self.processed
            .entry(meta_hash)
            .or_default()
            .insert(mini_block_hash);
    }

    pub fn remove_meta_block_hash(&mut self, meta_hash: &Hash) {
        self.processed.remove(meta_hash);
    }

    /// Removes a miniblock from every entry, dropping entries left empty.
    pub fn remove_mini_block_hash(&mut self, mini_block_hash: &Hash) {
        self.processed.retain(|_, mbs| {
            mbs.remove(mini_block_hash);
            !mbs.is_empty()
        });
    }

    /// Executed miniblocks confirmed by `meta_hash`.
    pub fn processed_mini_blocks_hashes(&self, meta_hash: &Hash) -> BTreeSet<Hash> {
        self.processed.get(meta_hash).cloned().unwrap_or_default()
    }

    pub fn is_mini_block_processed(&self, meta_hash: &Hash, mini_block_hash: &Hash) -> bool {
        self.processed
            .get(meta_hash)
            .is_some_and(|mbs| mbs.contains(mini_block_hash))
    }

    pub fn to_slice(&self) -> Vec<MiniBlocksInMeta> {
        self.processed
            .iter()
            .map(|(meta_hash, mbs)| MiniBlocksInMeta {
                meta_hash: *meta_hash,
                mini_blocks_hashes: mbs.iter().copied().collect(),
            })
            .collect()
    }

    /// Replaces the whole content with a persisted snapshot.
    pub fn restore_from_slice(&mut self, entries: &[MiniBlocksInMeta]) {
        self.processed = entries
            .iter()
            .filter(|e| !e.mini_blocks_hashes.is_empty())
            .map(|e| (e.meta_hash, e.mini_blocks_hashes.iter().copied().collect()))
            .collect();
    }

    /// Number of metachain headers with at least one executed miniblock.
    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_query() {
        let mut tracker = ProcessedMiniBlockTracker::new();
        tracker.add_mini_block_hash([1; 32], [10; 32]);
        tracker.add_mini_block_hash([1; 32], [11; 32]);

        assert!(tracker.is_mini_block_processed(&[1; 32], &[10; 32]));
        assert!(!tracker.is_mini_block_processed(&[2; 32], &[10; 32]));
        assert_eq!(tracker.processed_mini_blocks_hashes(&[1; 32]).len(), 2);
    }

    #[test]
    fn test_remove_mini_block_drops_empty_entries() {
        let mut tracker = ProcessedMiniBlockTracker::new();
        tracker.add_mini_block_hash([1; 32], [10; 32]);
        tracker.add_mini_block_hash([2; 32], [10; 32]);
        tracker.add_mini_block_hash([2; 32], [11; 32]);

        tracker.remove_mini_block_hash(&[10; 32]);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_mini_block_processed(&[2; 32], &[11; 32]));
    }

    #[test]
    fn test_slice_restores_same_content() {
        let mut tracker = ProcessedMiniBlockTracker::new();
        tracker.add_mini_block_hash([1; 32], [10; 32]);
        tracker.add_mini_block_hash([3; 32], [30; 32]);

        let mut restored = ProcessedMiniBlockTracker::new();
        restored.add_mini_block_hash([9; 32], [90; 32]);
        restored.restore_from_slice(&tracker.to_slice());
        assert_eq!(restored, tracker);
    }
}
