//! Headers referenced by the block currently being built or validated.
//!
//! The set is written by the block attempt itself and by header-arrival
//! handling running on other tasks. All access goes through one mutex, and
//! the aggregate missing counts are published from inside that same
//! critical section, so a waiter can never miss the transition to zero.

use crate::domain::deadline::Deadline;
use crate::error::{ProcessError, ProcessResult};
use parking_lot::Mutex;
use shared_types::{Hash, Header, HeaderHandler, ShardId};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;

/// One referenced header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInfo {
    /// `None` until the header arrives.
    pub header: Option<Header>,
    /// Referenced by the block itself (true) or only attesting finality (false).
    pub used_in_block: bool,
}

/// Outstanding data for the current block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MissingCounts {
    pub headers: u32,
    pub finality_attesting: u32,
}

impl MissingCounts {
    /// Nothing left to wait for.
    pub fn is_complete(&self) -> bool {
        self.headers == 0 && self.finality_attesting == 0
    }
}

/// State guarded by the set's mutex.
#[derive(Debug, Default)]
pub struct InFlightHeaders {
    entries: HashMap<Hash, HeaderInfo>,
    highest_nonce: HashMap<ShardId, u64>,
    missing: u32,
    missing_finality_attesting: u32,
}

impl InFlightHeaders {
    /// Clears every entry and counter.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.highest_nonce.clear();
        self.reset_missing();
    }

    /// Zeroes both missing counters, keeping entries.
    pub fn reset_missing(&mut self) {
        self.missing = 0;
        self.missing_finality_attesting = 0;
    }

    /// Registers a referenced header.
    ///
    /// `None` marks it missing (counted once per hash). A present header
    /// used in the block raises the shard's highest referenced nonce.
    pub fn register_reference(&mut self, hash: Hash, header: Option<Header>, used_in_block: bool) {
        match &header {
            None => {
                let already_missing = self
                    .entries
                    .get(&hash)
                    .is_some_and(|info| info.header.is_none());
                if !already_missing {
                    self.missing += 1;
                }
            }
            Some(h) if used_in_block => self.raise_highest_nonce(h),
            Some(_) => {}
        }
        self.entries.insert(
            hash,
            HeaderInfo {
                header,
                used_in_block,
            },
        );
    }

    /// Fills a missing entry. Returns false if `hash` was not waiting.
    pub fn mark_received(&mut self, hash: &Hash, header: &Header) -> bool {
        let Some(info) = self.entries.get_mut(hash) else {
            return false;
        };
        if info.header.is_some() {
            return false;
        }
        info.header = Some(header.clone());
        self.missing = self.missing.saturating_sub(1);
        self.raise_highest_nonce(header);
        true
    }

    fn raise_highest_nonce(&mut self, header: &Header) {
        let highest = self.highest_nonce.entry(header.shard_id()).or_insert(0);
        if header.nonce() > *highest {
            *highest = header.nonce();
        }
    }

    pub fn set_missing_finality_attesting(&mut self, count: u32) {
        self.missing_finality_attesting = count;
    }

    pub fn missing_count(&self) -> u32 {
        self.missing
    }

    pub fn finality_pending_count(&self) -> u32 {
        self.missing_finality_attesting
    }

    pub fn counts(&self) -> MissingCounts {
        MissingCounts {
            headers: self.missing,
            finality_attesting: self.missing_finality_attesting,
        }
    }

    /// Highest referenced nonce for `shard`, 0 if none.
    pub fn highest_nonce(&self, shard: ShardId) -> u64 {
        self.highest_nonce.get(&shard).copied().unwrap_or(0)
    }

    pub fn get(&self, hash: &Hash) -> Option<&HeaderInfo> {
        self.entries.get(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Present headers with the given usage flag, per shard, sorted by nonce.
    pub fn sorted_by_nonce(&self, used_in_block: bool) -> BTreeMap<ShardId, Vec<(Hash, Header)>> {
        let mut by_shard: BTreeMap<ShardId, Vec<(Hash, Header)>> = BTreeMap::new();
        for (hash, info) in &self.entries {
            if info.used_in_block != used_in_block {
                continue;
            }
            if let Some(header) = &info.header {
                by_shard
                    .entry(header.shard_id())
                    .or_default()
                    .push((*hash, header.clone()));
            }
        }
        for headers in by_shard.values_mut() {
            headers.sort_by(|a, b| a.1.nonce().cmp(&b.1.nonce()).then(a.0.cmp(&b.0)));
        }
        by_shard
    }

    /// Hashes of present headers of `shard` with the given usage flag, by nonce.
    pub fn sorted_hashes_for_shard(&self, shard: ShardId, used_in_block: bool) -> Vec<Hash> {
        self.sorted_by_nonce(used_in_block)
            .remove(&shard)
            .unwrap_or_default()
            .into_iter()
            .map(|(hash, _)| hash)
            .collect()
    }
}

/// Mutex-guarded [`InFlightHeaders`] plus a watch channel carrying the
/// missing counts.
pub struct InFlightHeaderSet {
    inner: Mutex<InFlightHeaders>,
    counts: watch::Sender<MissingCounts>,
}

impl Default for InFlightHeaderSet {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightHeaderSet {
    pub fn new() -> Self {
        let (counts, _) = watch::channel(MissingCounts::default());
        Self {
            inner: Mutex::new(InFlightHeaders::default()),
            counts,
        }
    }

    /// Runs `f` under the lock, then publishes the counts before unlocking.
    pub fn with<R>(&self, f: impl FnOnce(&mut InFlightHeaders) -> R) -> R {
        let mut guard = self.inner.lock();
        let result = f(&mut guard);
        let counts = guard.counts();
        self.counts.send_if_modified(|current| {
            if *current != counts {
                *current = counts;
                true
            } else {
                false
            }
        });
        result
    }

    /// Clears the set for a new block cycle.
    pub fn reset(&self) {
        self.with(|s| s.reset());
    }

    /// Snapshot of the missing counts, taken under the lock.
    pub fn counts(&self) -> MissingCounts {
        self.with(|s| s.counts())
    }

    /// Waits until both counters reach zero or the deadline passes.
    pub async fn wait_until_complete(&self, deadline: Deadline) -> ProcessResult<()> {
        let mut rx = self.counts.subscribe();
        let completed = matches!(
            tokio::time::timeout_at(deadline.instant(), rx.wait_for(|counts| counts.is_complete())).await,
            Ok(Ok(_))
        );
        if completed {
            Ok(())
        } else {
            Err(ProcessError::TimeIsOut)
        }
    }
}
