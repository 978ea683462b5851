//! # Block Tracker
//!
//! Per-shard notarization anchors and the pool of candidate headers that
//! have not been notarized yet.
//!
//! - `cross_notarized`: last header of a shard this node has seen notarized
//!   by the metachain (for the metachain itself: the last metachain header
//!   referenced by one of this shard's committed blocks).
//! - `self_notarized`: last header of a shard notarized from this node's own
//!   point of view.
//!
//! Anchors only move forward. A stale update is a no-op, never an error.

use crate::domain::header_validator::is_construction_valid;
use crate::error::{ProcessError, ProcessResult};
use parking_lot::RwLock;
use shared_types::{short_hex, Hash, Header, HeaderHandler, ShardId};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// A header together with its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedHeader {
    pub header: Header,
    pub hash: Hash,
}

impl TrackedHeader {
    pub fn new(header: Header, hash: Hash) -> Self {
        Self { header, hash }
    }

    pub fn nonce(&self) -> u64 {
        self.header.nonce()
    }
}

#[derive(Debug, Clone)]
struct ShardTrack {
    cross_notarized: TrackedHeader,
    self_notarized: TrackedHeader,
    candidates: BTreeMap<u64, Vec<TrackedHeader>>,
}

impl ShardTrack {
    fn anchored_at(anchor: TrackedHeader) -> Self {
        Self {
            cross_notarized: anchor.clone(),
            self_notarized: anchor,
            candidates: BTreeMap::new(),
        }
    }
}

/// Notarization state for every known shard.
#[derive(Debug, Default)]
pub struct BlockTracker {
    shards: RwLock<HashMap<ShardId, ShardTrack>>,
}

impl BlockTracker {
    /// Tracker anchored at the genesis header of every shard.
    pub fn new(genesis: impl IntoIterator<Item = TrackedHeader>) -> Self {
        let shards = genesis
            .into_iter()
            .map(|g| (g.header.shard_id(), ShardTrack::anchored_at(g)))
            .collect();
        Self {
            shards: RwLock::new(shards),
        }
    }

    pub fn get_last_cross_notarized(&self, shard: ShardId) -> ProcessResult<TrackedHeader> {
        self.shards
            .read()
            .get(&shard)
            .map(|t| t.cross_notarized.clone())
            .ok_or_else(|| unknown_shard(shard))
    }

    pub fn get_last_self_notarized(&self, shard: ShardId) -> ProcessResult<TrackedHeader> {
        self.shards
            .read()
            .get(&shard)
            .map(|t| t.self_notarized.clone())
            .ok_or_else(|| unknown_shard(shard))
    }

    /// Moves the cross-notarized anchor of `shard` forward.
    ///
    /// Returns false when the header is older than the current anchor.
    pub fn add_cross_notarized_header(&self, shard: ShardId, header: Header, hash: Hash) -> bool {
        let tracked = TrackedHeader::new(header, hash);
        let mut shards = self.shards.write();
        match shards.get_mut(&shard) {
            Some(track) => advance(&mut track.cross_notarized, tracked, shard, "cross"),
            None => {
                shards.insert(shard, ShardTrack::anchored_at(tracked));
                true
            }
        }
    }

    /// Moves the self-notarized anchor of `shard` forward.
    pub fn add_self_notarized_header(&self, shard: ShardId, header: Header, hash: Hash) -> bool {
        let tracked = TrackedHeader::new(header, hash);
        let mut shards = self.shards.write();
        match shards.get_mut(&shard) {
            Some(track) => advance(&mut track.self_notarized, tracked, shard, "self"),
            None => {
                shards.insert(shard, ShardTrack::anchored_at(tracked));
                true
            }
        }
    }

    /// Adds a candidate header to its shard's pool.
    ///
    /// Headers at or below the cross-notarized anchor and duplicates are
    /// ignored. Returns true if the header was added.
    pub fn add_tracked_header(&self, header: Header, hash: Hash) -> bool {
        let shard = header.shard_id();
        let mut shards = self.shards.write();
        let Some(track) = shards.get_mut(&shard) else {
            return false;
        };
        let nonce = header.nonce();
        if nonce <= track.cross_notarized.nonce() {
            return false;
        }
        let at_nonce = track.candidates.entry(nonce).or_default();
        if at_nonce.iter().any(|t| t.hash == hash) {
            return false;
        }
        at_nonce.push(TrackedHeader::new(header, hash));
        trace!(shard, nonce, hash = %short_hex(&hash), "tracked header added");
        true
    }

    /// Candidates of `shard` with exactly `nonce`.
    pub fn tracked_headers_with_nonce(&self, shard: ShardId, nonce: u64) -> Vec<TrackedHeader> {
        self.shards
            .read()
            .get(&shard)
            .and_then(|t| t.candidates.get(&nonce).cloned())
            .unwrap_or_default()
    }

    /// All candidates of `shard`, sorted by nonce.
    pub fn tracked_headers(&self, shard: ShardId) -> Vec<TrackedHeader> {
        self.shards
            .read()
            .get(&shard)
            .map(|t| t.candidates.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Longest chain of candidates built on the cross-notarized anchor.
    ///
    /// When several candidates at one nonce chain correctly, the one with
    /// the longest chain of descendants wins; ties go to the earliest
    /// arrival. The chain ends at the first nonce with no valid successor.
    pub fn compute_longest_chain_from_last_notarized(
        &self,
        shard: ShardId,
    ) -> ProcessResult<Vec<TrackedHeader>> {
        let shards = self.shards.read();
        let track = shards.get(&shard).ok_or_else(|| unknown_shard(shard))?;

        let anchor = &track.cross_notarized.header;
        let first = anchor.nonce() + 1;

        // (nonce, index) -> (length of the best chain starting here, index of its successor)
        let mut best: HashMap<(u64, usize), (usize, Option<usize>)> = HashMap::new();
        for (&nonce, at_nonce) in track.candidates.range(first..).rev() {
            let successors = track.candidates.get(&(nonce + 1));
            for (idx, candidate) in at_nonce.iter().enumerate() {
                let mut entry = (1, None);
                for (next_idx, next) in successors.into_iter().flatten().enumerate() {
                    let Some(&(len, _)) = best.get(&(nonce + 1, next_idx)) else {
                        continue;
                    };
                    if len + 1 > entry.0 && is_construction_valid(&next.header, Some(&candidate.header)) {
                        entry = (len + 1, Some(next_idx));
                    }
                }
                best.insert((nonce, idx), entry);
            }
        }

        let mut head = None;
        let mut head_len = 0;
        for (idx, candidate) in track.candidates.get(&first).into_iter().flatten().enumerate() {
            let len = best.get(&(first, idx)).map_or(0, |(len, _)| *len);
            if len > head_len && is_construction_valid(&candidate.header, Some(anchor)) {
                head = Some(idx);
                head_len = len;
            }
        }

        let mut chain = Vec::with_capacity(head_len);
        let mut nonce = first;
        while let Some(idx) = head {
            let Some(candidate) = track.candidates.get(&nonce).and_then(|at| at.get(idx)) else {
                break;
            };
            chain.push(candidate.clone());
            head = best.get(&(nonce, idx)).and_then(|(_, next)| *next);
            nonce += 1;
        }
        Ok(chain)
    }

    /// Drops candidates of `shard` whose nonce is below both anchors.
    pub fn cleanup_headers_behind_nonce(
        &self,
        shard: ShardId,
        self_notarized_nonce: u64,
        cross_notarized_nonce: u64,
    ) {
        let below = self_notarized_nonce.min(cross_notarized_nonce);
        if below == 0 {
            return;
        }
        let mut shards = self.shards.write();
        if let Some(track) = shards.get_mut(&shard) {
            track.candidates = track.candidates.split_off(&below);
            debug!(shard, below, remaining = track.candidates.len(), "tracker cleaned");
        }
    }

    /// Removes one candidate by hash.
    pub fn remove_tracked_header(&self, shard: ShardId, nonce: u64, hash: &Hash) {
        let mut shards = self.shards.write();
        if let Some(track) = shards.get_mut(&shard) {
            if let Some(at_nonce) = track.candidates.get_mut(&nonce) {
                at_nonce.retain(|t| &t.hash != hash);
                if at_nonce.is_empty() {
                    track.candidates.remove(&nonce);
                }
            }
        }
    }

    /// Cross-notarized anchor of every shard, sorted by shard id.
    pub fn cross_notarized_anchors(&self) -> Vec<(ShardId, TrackedHeader)> {
        let shards = self.shards.read();
        let mut anchors: Vec<_> = shards
            .iter()
            .map(|(shard, t)| (*shard, t.cross_notarized.clone()))
            .collect();
        anchors.sort_by_key(|(shard, _)| *shard);
        anchors
    }
}

fn advance(anchor: &mut TrackedHeader, tracked: TrackedHeader, shard: ShardId, kind: &str) -> bool {
    if tracked.nonce() < anchor.nonce() {
        trace!(shard, kind, current = anchor.nonce(), stale = tracked.nonce(), "stale anchor update ignored");
        return false;
    }
    debug!(shard, kind, nonce = tracked.nonce(), hash = %short_hex(&tracked.hash), "notarized anchor advanced");
    *anchor = tracked;
    true
}

fn unknown_shard(shard: ShardId) -> ProcessError {
    ProcessError::not_found(format!("tracker state for shard {shard}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use proptest::prelude::*;

    fn tracker_with_meta_genesis() -> (BlockTracker, shared_types::MetaHeader) {
        let genesis = meta_genesis();
        let (header, hash) = meta_tracked(&genesis);
        (BlockTracker::new([TrackedHeader::new(header, hash)]), genesis)
    }

    #[test]
    fn test_unknown_shard_is_not_found() {
        let tracker = BlockTracker::default();
        assert!(matches!(
            tracker.get_last_cross_notarized(3),
            Err(ProcessError::NotFound { .. })
        ));
        assert!(tracker.compute_longest_chain_from_last_notarized(3).is_err());
    }

    #[test]
    fn test_stale_anchor_update_is_noop() {
        let (tracker, genesis) = tracker_with_meta_genesis();
        let chain = meta_chain(&genesis, 3);
        let (h3, hash3) = meta_tracked(&chain[2].0);
        let (h1, hash1) = meta_tracked(&chain[0].0);

        assert!(tracker.add_cross_notarized_header(META, h3, hash3));
        assert!(!tracker.add_cross_notarized_header(META, h1, hash1));
        assert_eq!(tracker.get_last_cross_notarized(META).unwrap().nonce(), 3);
    }

    #[test]
    fn test_longest_chain_stops_at_gap() {
        let (tracker, genesis) = tracker_with_meta_genesis();
        let chain = meta_chain(&genesis, 15);
        let (h10, hash10) = meta_tracked(&chain[9].0);
        tracker.add_cross_notarized_header(META, h10, hash10);

        for nonce in [11u64, 12, 14, 15] {
            let (h, hash) = meta_tracked(&chain[nonce as usize - 1].0);
            assert!(tracker.add_tracked_header(h, hash));
        }

        let longest = tracker.compute_longest_chain_from_last_notarized(META).unwrap();
        let nonces: Vec<u64> = longest.iter().map(TrackedHeader::nonce).collect();
        assert_eq!(nonces, vec![11, 12]);
    }

    #[test]
    fn test_longest_chain_skips_forks_that_do_not_chain() {
        let (tracker, genesis) = tracker_with_meta_genesis();
        let chain = meta_chain(&genesis, 2);
        let mut fork = chain[0].0.clone();
        fork.prev_hash = [0xEE; 32];
        let (fh, fhash) = meta_tracked(&fork);
        let (h1, hash1) = meta_tracked(&chain[0].0);
        let (h2, hash2) = meta_tracked(&chain[1].0);

        tracker.add_tracked_header(fh, fhash);
        tracker.add_tracked_header(h1, hash1);
        tracker.add_tracked_header(h2, hash2);

        let longest = tracker.compute_longest_chain_from_last_notarized(META).unwrap();
        assert_eq!(longest.len(), 2);
        assert_eq!(longest[0].hash, hash1);
        assert_eq!(longest[1].hash, hash2);
    }

    #[test]
    fn test_longest_chain_prefers_branch_with_more_descendants() {
        let (tracker, genesis) = tracker_with_meta_genesis();
        let chain = meta_chain(&genesis, 3);
        // Valid sibling of nonce 1 with no successors.
        let mut sibling = chain[0].0.clone();
        sibling.rand_seed = vec![0xEE; 4];
        let (sh, shash) = meta_tracked(&sibling);

        assert!(tracker.add_tracked_header(sh, shash));
        for (meta, _) in &chain {
            let (h, hash) = meta_tracked(meta);
            assert!(tracker.add_tracked_header(h, hash));
        }

        let longest = tracker.compute_longest_chain_from_last_notarized(META).unwrap();
        let hashes: Vec<Hash> = longest.iter().map(|t| t.hash).collect();
        assert_eq!(hashes, vec![chain[0].1, chain[1].1, chain[2].1]);
    }

    #[test]
    fn test_longest_chain_ties_go_to_earliest_arrival() {
        let (tracker, genesis) = tracker_with_meta_genesis();
        let chain = meta_chain(&genesis, 1);
        let mut sibling = chain[0].0.clone();
        sibling.rand_seed = vec![0xEE; 4];
        let (sh, shash) = meta_tracked(&sibling);
        let (h1, hash1) = meta_tracked(&chain[0].0);

        tracker.add_tracked_header(sh, shash);
        tracker.add_tracked_header(h1, hash1);

        let longest = tracker.compute_longest_chain_from_last_notarized(META).unwrap();
        assert_eq!(longest.len(), 1);
        assert_eq!(longest[0].hash, shash);
    }

    #[test]
    fn test_tracked_headers_ignore_old_and_duplicates() {
        let (tracker, genesis) = tracker_with_meta_genesis();
        let (g, ghash) = meta_tracked(&genesis);
        assert!(!tracker.add_tracked_header(g, ghash));

        let chain = meta_chain(&genesis, 1);
        let (h1, hash1) = meta_tracked(&chain[0].0);
        assert!(tracker.add_tracked_header(h1.clone(), hash1));
        assert!(!tracker.add_tracked_header(h1, hash1));
        assert_eq!(tracker.tracked_headers_with_nonce(META, 1).len(), 1);
    }

    #[test]
    fn test_cleanup_behind_both_anchors() {
        let (tracker, genesis) = tracker_with_meta_genesis();
        let chain = meta_chain(&genesis, 6);
        for (meta, _) in &chain {
            let (h, hash) = meta_tracked(meta);
            tracker.add_tracked_header(h, hash);
        }

        tracker.cleanup_headers_behind_nonce(META, 4, 3);
        let nonces: Vec<u64> = tracker.tracked_headers(META).iter().map(TrackedHeader::nonce).collect();
        assert_eq!(nonces, vec![3, 4, 5, 6]);

        tracker.cleanup_headers_behind_nonce(META, 0, 6);
        assert_eq!(tracker.tracked_headers(META).len(), 4);
    }

    proptest! {
        #[test]
        fn anchor_is_order_independent(order in Just((1usize..=12).collect::<Vec<_>>()).prop_shuffle()) {
            let (tracker, genesis) = tracker_with_meta_genesis();
            let chain = meta_chain(&genesis, 12);
            let mut last_seen = 0;
            for idx in order {
                let (h, hash) = meta_tracked(&chain[idx - 1].0);
                tracker.add_cross_notarized_header(META, h, hash);
                let anchor = tracker.get_last_cross_notarized(META).unwrap().nonce();
                prop_assert!(anchor >= last_seen);
                last_seen = anchor;
            }
            prop_assert_eq!(last_seen, 12);
            prop_assert_eq!(tracker.get_last_cross_notarized(META).unwrap().hash, chain[11].1);
        }

        #[test]
        fn longest_chain_is_prefix_below_gap(len in 2usize..20, gap_seed in any::<usize>()) {
            let (tracker, genesis) = tracker_with_meta_genesis();
            let chain = meta_chain(&genesis, len);
            let gap = 1 + gap_seed % len;
            for (meta, _) in chain.iter().filter(|(m, _)| m.nonce as usize != gap) {
                let (h, hash) = meta_tracked(meta);
                tracker.add_tracked_header(h, hash);
            }
            let longest = tracker.compute_longest_chain_from_last_notarized(META).unwrap();
            let nonces: Vec<u64> = longest.iter().map(TrackedHeader::nonce).collect();
            let expected: Vec<u64> = (1..gap as u64).collect();
            prop_assert_eq!(nonces, expected);
        }
    }
}
