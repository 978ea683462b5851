//! # Block Entities
//!
//! Shard headers, metachain headers, miniblocks and block bodies.
//!
//! ## Clusters
//!
//! - **Headers**: `ShardHeader`, `MetaHeader`, the closed `Header` variant and
//!   the `HeaderHandler` accessor trait shared by both.
//! - **Bodies**: `MiniBlock`, `MiniBlockHeader`, `Body`.
//! - **Notarization**: `ShardData`, `EpochStart`, `EpochStartShardData`.
//!
//! Every type here is hashed through its bincode encoding, so collections
//! are ordered (`Vec`, `BTreeMap`) and never `HashMap`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// PRIMITIVES
// =============================================================================

/// A 32-byte Keccak-256 hash.
pub type Hash = [u8; 32];

/// Shard identifier. The metachain uses [`METACHAIN_SHARD_ID`].
pub type ShardId = u32;

/// Shard id reserved for the metachain.
pub const METACHAIN_SHARD_ID: ShardId = u32::MAX;

/// All-zero hash, used as "no hash".
pub const EMPTY_HASH: Hash = [0u8; 32];

// =============================================================================
// MINIBLOCKS
// =============================================================================

/// Kind of transactions a miniblock carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MiniBlockType {
    /// Plain value/transfer transactions.
    #[default]
    Transaction,
    /// Execution receipts.
    Receipt,
    /// Smart contract results.
    SmartContractResult,
    /// Validator/peer changes.
    Peer,
    /// Transactions that failed validation but are still accounted for.
    Invalid,
}

/// A batch of transactions going from one shard to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MiniBlock {
    /// Hashes of the transactions in this miniblock.
    pub tx_hashes: Vec<Hash>,
    /// Shard that produced the transactions.
    pub sender_shard_id: ShardId,
    /// Shard whose accounts the transactions affect.
    pub receiver_shard_id: ShardId,
    /// Transaction kind.
    pub mb_type: MiniBlockType,
}

impl MiniBlock {
    /// Creates a miniblock of the given type.
    pub fn new(
        sender_shard_id: ShardId,
        receiver_shard_id: ShardId,
        mb_type: MiniBlockType,
        tx_hashes: Vec<Hash>,
    ) -> Self {
        Self {
            tx_hashes,
            sender_shard_id,
            receiver_shard_id,
            mb_type,
        }
    }

    /// True for miniblocks whose sender and receiver are the same shard.
    pub fn is_intra_shard(&self) -> bool {
        self.sender_shard_id == self.receiver_shard_id
    }
}

/// Summary of a miniblock carried inside its parent header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MiniBlockHeader {
    /// Hash of the full miniblock.
    pub hash: Hash,
    /// Sender shard.
    pub sender_shard_id: ShardId,
    /// Receiver shard.
    pub receiver_shard_id: ShardId,
    /// Number of transactions in the miniblock.
    pub tx_count: u32,
    /// Transaction kind.
    pub mb_type: MiniBlockType,
}

/// A block body: the ordered list of miniblocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Body {
    /// Miniblocks in block order.
    pub mini_blocks: Vec<MiniBlock>,
}

impl Body {
    /// Wraps a list of miniblocks.
    pub fn new(mini_blocks: Vec<MiniBlock>) -> Self {
        Self { mini_blocks }
    }

    /// Total transaction count across all miniblocks.
    pub fn tx_count(&self) -> usize {
        self.mini_blocks.iter().map(|mb| mb.tx_hashes.len()).sum()
    }

    /// True if the body has no miniblocks.
    pub fn is_empty(&self) -> bool {
        self.mini_blocks.is_empty()
    }
}

// =============================================================================
// SHARD HEADER
// =============================================================================

/// Header of a block produced by a regular shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShardHeader {
    /// Producing shard.
    pub shard_id: ShardId,
    /// Height in this shard's chain.
    pub nonce: u64,
    /// Consensus round the block was proposed in.
    pub round: u64,
    /// Epoch the block belongs to.
    pub epoch: u32,
    /// Proposal timestamp (unix seconds).
    pub timestamp: u64,
    /// Hash of the previous shard header.
    pub prev_hash: Hash,
    /// Randomness seed of the previous header.
    pub prev_rand_seed: Vec<u8>,
    /// Randomness seed of this header.
    pub rand_seed: Vec<u8>,
    /// Accounts state root after executing the body.
    pub root_hash: Hash,
    /// Consensus group participation bitmap.
    pub pub_keys_bitmap: Vec<u8>,
    /// Aggregated consensus signature.
    pub signature: Vec<u8>,
    /// Fees accumulated by the transactions in this block.
    pub accumulated_fees: u128,
    /// Total transactions referenced by the miniblock headers.
    pub tx_count: u32,
    /// Hash over the receipts produced while executing the block.
    pub receipts_hash: Hash,
    /// One entry per miniblock in the body.
    pub mini_block_headers: Vec<MiniBlockHeader>,
    /// Metachain headers referenced by this block, sorted by nonce.
    pub meta_block_hashes: Vec<Hash>,
    /// Set on the first block of an epoch: hash of the epoch-start meta header.
    pub epoch_start_meta_hash: Option<Hash>,
}

impl ShardHeader {
    /// Miniblock hash to sender shard, for miniblocks this shard receives
    /// from other shards.
    pub fn mini_block_headers_with_dst(&self, dst: ShardId) -> BTreeMap<Hash, ShardId> {
        self.mini_block_headers
            .iter()
            .filter(|mbh| mbh.receiver_shard_id == dst && mbh.sender_shard_id != dst)
            .map(|mbh| (mbh.hash, mbh.sender_shard_id))
            .collect()
    }

    /// Miniblock hash to receiver shard for every miniblock in the header.
    pub fn map_mini_block_hashes_to_shards(&self) -> BTreeMap<Hash, ShardId> {
        self.mini_block_headers
            .iter()
            .map(|mbh| (mbh.hash, mbh.receiver_shard_id))
            .collect()
    }
}

// =============================================================================
// META HEADER
// =============================================================================

/// A shard header as summarized inside a metachain header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShardData {
    /// Shard the notarized header belongs to.
    pub shard_id: ShardId,
    /// Hash of the notarized shard header.
    pub header_hash: Hash,
    /// Nonce of the notarized shard header.
    pub nonce: u64,
    /// Round of the notarized shard header.
    pub round: u64,
    /// Previous hash of the notarized shard header.
    pub prev_hash: Hash,
    /// Miniblock headers of the notarized shard header.
    pub shard_mini_block_headers: Vec<MiniBlockHeader>,
    /// Transactions in the notarized shard header.
    pub tx_count: u32,
}

/// Per-shard data frozen at an epoch boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EpochStartShardData {
    pub shard_id: ShardId,
    pub header_hash: Hash,
    pub root_hash: Hash,
    pub nonce: u64,
    pub round: u64,
    pub first_pending_meta_block: Hash,
    pub last_finished_meta_block: Hash,
}

/// Epoch-start payload of a metachain header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EpochStart {
    /// Last finalized header of every shard at the epoch boundary.
    pub last_finalized_headers: Vec<EpochStartShardData>,
}

/// Header of a metachain block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MetaHeader {
    pub nonce: u64,
    pub round: u64,
    pub epoch: u32,
    pub timestamp: u64,
    pub prev_hash: Hash,
    pub prev_rand_seed: Vec<u8>,
    pub rand_seed: Vec<u8>,
    pub root_hash: Hash,
    pub pub_keys_bitmap: Vec<u8>,
    pub signature: Vec<u8>,
    pub accumulated_fees: u128,
    pub tx_count: u32,
    /// Shard headers notarized by this metachain header.
    pub shard_info: Vec<ShardData>,
    /// Miniblocks produced by the metachain itself.
    pub mini_block_headers: Vec<MiniBlockHeader>,
    /// Present only on epoch-start metachain headers.
    pub epoch_start: Option<EpochStart>,
}

impl MetaHeader {
    /// Miniblock hash to sender shard for every cross-shard miniblock with
    /// destination `dst` confirmed by this header.
    ///
    /// Miniblocks of `dst` itself listed in `shard_info` are skipped: a shard
    /// never needs confirmation for what it sent.
    pub fn mini_block_headers_with_dst(&self, dst: ShardId) -> BTreeMap<Hash, ShardId> {
        let mut hashes = BTreeMap::new();
        for shard_data in self.shard_info.iter().filter(|sd| sd.shard_id != dst) {
            for mbh in &shard_data.shard_mini_block_headers {
                if mbh.receiver_shard_id == dst {
                    hashes.insert(mbh.hash, mbh.sender_shard_id);
                }
            }
        }
        for mbh in &self.mini_block_headers {
            if mbh.receiver_shard_id == dst {
                hashes.insert(mbh.hash, mbh.sender_shard_id);
            }
        }
        hashes
    }

    /// True when this header carries epoch-start data.
    pub fn is_start_of_epoch(&self) -> bool {
        self.epoch_start
            .as_ref()
            .is_some_and(|es| !es.last_finalized_headers.is_empty())
    }
}

// =============================================================================
// HEADER VARIANT + ACCESSORS
// =============================================================================

/// Accessors common to shard and metachain headers.
pub trait HeaderHandler {
    fn shard_id(&self) -> ShardId;
    fn nonce(&self) -> u64;
    fn round(&self) -> u64;
    fn epoch(&self) -> u32;
    fn prev_hash(&self) -> &Hash;
    fn prev_rand_seed(&self) -> &[u8];
    fn rand_seed(&self) -> &[u8];
    fn root_hash(&self) -> &Hash;
    fn is_start_of_epoch(&self) -> bool;
    fn mini_block_headers(&self) -> &[MiniBlockHeader];
    fn mini_block_headers_with_dst(&self, dst: ShardId) -> BTreeMap<Hash, ShardId>;
}

impl HeaderHandler for ShardHeader {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }
    fn nonce(&self) -> u64 {
        self.nonce
    }
    fn round(&self) -> u64 {
        self.round
    }
    fn epoch(&self) -> u32 {
        self.epoch
    }
    fn prev_hash(&self) -> &Hash {
        &self.prev_hash
    }
    fn prev_rand_seed(&self) -> &[u8] {
        &self.prev_rand_seed
    }
    fn rand_seed(&self) -> &[u8] {
        &self.rand_seed
    }
    fn root_hash(&self) -> &Hash {
        &self.root_hash
    }
    fn is_start_of_epoch(&self) -> bool {
        self.epoch_start_meta_hash.is_some()
    }
    fn mini_block_headers(&self) -> &[MiniBlockHeader] {
        &self.mini_block_headers
    }
    fn mini_block_headers_with_dst(&self, dst: ShardId) -> BTreeMap<Hash, ShardId> {
        ShardHeader::mini_block_headers_with_dst(self, dst)
    }
}

impl HeaderHandler for MetaHeader {
    fn shard_id(&self) -> ShardId {
        METACHAIN_SHARD_ID
    }
    fn nonce(&self) -> u64 {
        self.nonce
    }
    fn round(&self) -> u64 {
        self.round
    }
    fn epoch(&self) -> u32 {
        self.epoch
    }
    fn prev_hash(&self) -> &Hash {
        &self.prev_hash
    }
    fn prev_rand_seed(&self) -> &[u8] {
        &self.prev_rand_seed
    }
    fn rand_seed(&self) -> &[u8] {
        &self.rand_seed
    }
    fn root_hash(&self) -> &Hash {
        &self.root_hash
    }
    fn is_start_of_epoch(&self) -> bool {
        MetaHeader::is_start_of_epoch(self)
    }
    fn mini_block_headers(&self) -> &[MiniBlockHeader] {
        &self.mini_block_headers
    }
    fn mini_block_headers_with_dst(&self, dst: ShardId) -> BTreeMap<Hash, ShardId> {
        MetaHeader::mini_block_headers_with_dst(self, dst)
    }
}

/// A shard or metachain header.
///
/// Call sites that need the concrete kind match on the variant; everything
/// else goes through [`HeaderHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Header {
    Shard(ShardHeader),
    Meta(MetaHeader),
}

impl Header {
    /// The inner shard header, if this is one.
    pub fn as_shard(&self) -> Option<&ShardHeader> {
        match self {
            Header::Shard(h) => Some(h),
            Header::Meta(_) => None,
        }
    }

    /// The inner metachain header, if this is one.
    pub fn as_meta(&self) -> Option<&MetaHeader> {
        match self {
            Header::Meta(h) => Some(h),
            Header::Shard(_) => None,
        }
    }

    fn handler(&self) -> &dyn HeaderHandler {
        match self {
            Header::Shard(h) => h,
            Header::Meta(h) => h,
        }
    }
}

impl From<ShardHeader> for Header {
    fn from(h: ShardHeader) -> Self {
        Header::Shard(h)
    }
}

impl From<MetaHeader> for Header {
    fn from(h: MetaHeader) -> Self {
        Header::Meta(h)
    }
}

impl HeaderHandler for Header {
    fn shard_id(&self) -> ShardId {
        self.handler().shard_id()
    }
    fn nonce(&self) -> u64 {
        self.handler().nonce()
    }
    fn round(&self) -> u64 {
        self.handler().round()
    }
    fn epoch(&self) -> u32 {
        self.handler().epoch()
    }
    fn prev_hash(&self) -> &Hash {
        self.handler().prev_hash()
    }
    fn prev_rand_seed(&self) -> &[u8] {
        self.handler().prev_rand_seed()
    }
    fn rand_seed(&self) -> &[u8] {
        self.handler().rand_seed()
    }
    fn root_hash(&self) -> &Hash {
        self.handler().root_hash()
    }
    fn is_start_of_epoch(&self) -> bool {
        self.handler().is_start_of_epoch()
    }
    fn mini_block_headers(&self) -> &[MiniBlockHeader] {
        self.handler().mini_block_headers()
    }
    fn mini_block_headers_with_dst(&self, dst: ShardId) -> BTreeMap<Hash, ShardId> {
        self.handler().mini_block_headers_with_dst(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbh(hash: u8, sender: ShardId, receiver: ShardId) -> MiniBlockHeader {
        MiniBlockHeader {
            hash: [hash; 32],
            sender_shard_id: sender,
            receiver_shard_id: receiver,
            tx_count: 1,
            mb_type: MiniBlockType::Transaction,
        }
    }

    #[test]
    fn test_shard_header_dst_excludes_own_sender() {
        let header = ShardHeader {
            shard_id: 1,
            mini_block_headers: vec![mbh(1, 0, 1), mbh(2, 1, 1), mbh(3, 1, 2)],
            ..Default::default()
        };

        let dst = header.mini_block_headers_with_dst(1);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst.get(&[1; 32]), Some(&0));
    }

    #[test]
    fn test_meta_header_dst_skips_destination_shard_info() {
        let meta = MetaHeader {
            shard_info: vec![
                ShardData {
                    shard_id: 0,
                    shard_mini_block_headers: vec![mbh(1, 0, 1), mbh(2, 0, 2)],
                    ..Default::default()
                },
                ShardData {
                    shard_id: 1,
                    shard_mini_block_headers: vec![mbh(3, 1, 1)],
                    ..Default::default()
                },
            ],
            mini_block_headers: vec![mbh(4, METACHAIN_SHARD_ID, 1)],
            ..Default::default()
        };

        let dst = meta.mini_block_headers_with_dst(1);
        assert_eq!(dst.len(), 2);
        assert!(dst.contains_key(&[1; 32]));
        assert!(dst.contains_key(&[4; 32]));
        assert!(!dst.contains_key(&[3; 32]));
    }

    #[test]
    fn test_header_variant_delegates_accessors() {
        let header: Header = ShardHeader {
            shard_id: 2,
            nonce: 7,
            round: 9,
            epoch_start_meta_hash: Some([5; 32]),
            ..Default::default()
        }
        .into();

        assert_eq!(header.shard_id(), 2);
        assert_eq!(header.nonce(), 7);
        assert_eq!(header.round(), 9);
        assert!(header.is_start_of_epoch());
        assert!(header.as_meta().is_none());

        let meta: Header = MetaHeader::default().into();
        assert_eq!(meta.shard_id(), METACHAIN_SHARD_ID);
        assert!(!meta.is_start_of_epoch());
    }

    #[test]
    fn test_body_tx_count() {
        let body = Body::new(vec![
            MiniBlock::new(0, 1, MiniBlockType::Transaction, vec![[1; 32], [2; 32]]),
            MiniBlock::new(0, 0, MiniBlockType::Receipt, vec![[3; 32]]),
        ]);
        assert_eq!(body.tx_count(), 3);
        assert!(body.mini_blocks[1].is_intra_shard());
    }
}
