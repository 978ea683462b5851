//! Chain builders shared by unit tests.

use shared_types::{calculate_hash, Hash, Header, MetaHeader, ShardHeader, METACHAIN_SHARD_ID};

pub fn meta_genesis() -> MetaHeader {
    MetaHeader {
        rand_seed: vec![0xAA; 4],
        ..Default::default()
    }
}

pub fn shard_genesis(shard_id: u32) -> ShardHeader {
    ShardHeader {
        shard_id,
        rand_seed: vec![0xBB; 4],
        ..Default::default()
    }
}

pub fn meta_hash(meta: &MetaHeader) -> Hash {
    calculate_hash(meta).unwrap()
}

pub fn shard_hash(header: &ShardHeader) -> Hash {
    calculate_hash(header).unwrap()
}

/// Metachain header chained on top of `prev`, one round later.
pub fn next_meta(prev: &MetaHeader) -> MetaHeader {
    MetaHeader {
        nonce: prev.nonce + 1,
        round: prev.round + 1,
        epoch: prev.epoch,
        prev_hash: meta_hash(prev),
        prev_rand_seed: prev.rand_seed.clone(),
        rand_seed: vec![(prev.nonce + 1) as u8; 4],
        ..Default::default()
    }
}

/// `len` metachain headers chained on top of `from`, with their hashes.
pub fn meta_chain(from: &MetaHeader, len: usize) -> Vec<(MetaHeader, Hash)> {
    let mut chain = Vec::with_capacity(len);
    let mut prev = from.clone();
    for _ in 0..len {
        let next = next_meta(&prev);
        chain.push((next.clone(), meta_hash(&next)));
        prev = next;
    }
    chain
}

/// Shard header chained on top of `prev`, one round later.
pub fn next_shard(prev: &ShardHeader) -> ShardHeader {
    ShardHeader {
        shard_id: prev.shard_id,
        nonce: prev.nonce + 1,
        round: prev.round + 1,
        epoch: prev.epoch,
        prev_hash: shard_hash(prev),
        prev_rand_seed: prev.rand_seed.clone(),
        rand_seed: vec![(prev.nonce + 1) as u8; 4],
        ..Default::default()
    }
}

pub fn meta_tracked(meta: &MetaHeader) -> (Header, Hash) {
    (Header::Meta(meta.clone()), meta_hash(meta))
}

pub const META: u32 = METACHAIN_SHARD_ID;
