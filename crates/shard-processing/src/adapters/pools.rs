//! In-memory data pools for headers and miniblocks received from the network.

use parking_lot::RwLock;
use shared_types::{Hash, Header, HeaderHandler, MiniBlock, ShardId};
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Default)]
struct HeadersInner {
    by_hash: HashMap<Hash, Header>,
    by_shard_nonce: HashMap<ShardId, BTreeMap<u64, Vec<Hash>>>,
}

impl HeadersInner {
    fn remove(&mut self, hash: &Hash) -> Option<Header> {
        let header = self.by_hash.remove(hash)?;
        if let Some(nonces) = self.by_shard_nonce.get_mut(&header.shard_id()) {
            if let Some(hashes) = nonces.get_mut(&header.nonce()) {
                hashes.retain(|h| h != hash);
                if hashes.is_empty() {
                    nonces.remove(&header.nonce());
                }
            }
        }
        Some(header)
    }

    /// Lowest-nonce header of the shard holding the most headers.
    fn eviction_candidate(&self) -> Option<Hash> {
        self.by_shard_nonce
            .values()
            .max_by_key(|nonces| nonces.values().map(Vec::len).sum::<usize>())
            .and_then(|nonces| nonces.values().next())
            .and_then(|hashes| hashes.first().copied())
    }
}

/// Headers by hash and by (shard, nonce), bounded by capacity.
#[derive(Debug)]
pub struct HeadersPool {
    capacity: usize,
    inner: RwLock<HeadersInner>,
}

impl HeadersPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(HeadersInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds a header, evicting the oldest header of the fullest shard when at
    /// capacity. Returns false if the hash was already present.
    pub fn add(&self, hash: Hash, header: Header) -> bool {
        let mut inner = self.inner.write();
        if inner.by_hash.contains_key(&hash) {
            return false;
        }
        if inner.by_hash.len() >= self.capacity {
            if let Some(victim) = inner.eviction_candidate() {
                inner.remove(&victim);
            }
        }
        inner
            .by_shard_nonce
            .entry(header.shard_id())
            .or_default()
            .entry(header.nonce())
            .or_default()
            .push(hash);
        inner.by_hash.insert(hash, header);
        true
    }

    pub fn get(&self, hash: &Hash) -> Option<Header> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }

    pub fn headers_by_nonce(&self, shard: ShardId, nonce: u64) -> Vec<(Header, Hash)> {
        let inner = self.inner.read();
        inner
            .by_shard_nonce
            .get(&shard)
            .and_then(|nonces| nonces.get(&nonce))
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|h| inner.by_hash.get(h).map(|hdr| (hdr.clone(), *h)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove(&self, hash: &Hash) -> Option<Header> {
        self.inner.write().remove(hash)
    }

    /// Removes every header of `shard` with nonce strictly below `nonce`
    /// and returns them.
    pub fn remove_behind_nonce(&self, shard: ShardId, nonce: u64) -> Vec<(Hash, Header)> {
        let mut inner = self.inner.write();
        let behind: Vec<Hash> = inner
            .by_shard_nonce
            .get(&shard)
            .map(|nonces| nonces.range(..nonce).flat_map(|(_, h)| h.iter().copied()).collect())
            .unwrap_or_default();
        behind
            .into_iter()
            .filter_map(|hash| inner.remove(&hash).map(|header| (hash, header)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct MiniBlocksInner {
    by_hash: HashMap<Hash, MiniBlock>,
    order: VecDeque<Hash>,
}

/// Miniblocks by hash, evicting the oldest entry when full.
#[derive(Debug)]
pub struct MiniBlocksPool {
    capacity: usize,
    inner: RwLock<MiniBlocksInner>,
}

impl MiniBlocksPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(MiniBlocksInner::default()),
        }
    }

    pub fn put(&self, hash: Hash, mini_block: MiniBlock) -> bool {
        let mut inner = self.inner.write();
        if inner.by_hash.contains_key(&hash) {
            return false;
        }
        while inner.by_hash.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.by_hash.remove(&oldest);
        }
        inner.order.push_back(hash);
        inner.by_hash.insert(hash, mini_block);
        true
    }

    pub fn get(&self, hash: &Hash) -> Option<MiniBlock> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }

    pub fn remove(&self, hash: &Hash) -> Option<MiniBlock> {
        let mut inner = self.inner.write();
        let removed = inner.by_hash.remove(hash)?;
        inner.order.retain(|h| h != hash);
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Header and miniblock pools of one node.
#[derive(Debug)]
pub struct DataPool {
    pub headers: HeadersPool,
    pub mini_blocks: MiniBlocksPool,
}

impl DataPool {
    pub fn new(headers_capacity: usize, mini_blocks_capacity: usize) -> Self {
        Self {
            headers: HeadersPool::new(headers_capacity),
            mini_blocks: MiniBlocksPool::new(mini_blocks_capacity),
        }
    }
}
