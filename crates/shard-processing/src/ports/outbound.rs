//! # Outbound Ports (Driven Ports)
//!
//! Capabilities the shard block processor consumes. Production wiring lives
//! with the node; in-memory versions of the storage-like ports live in
//! `crate::adapters`.

use crate::domain::{BootstrapData, Deadline};
use crate::error::ProcessResult;
use async_trait::async_trait;
use shared_types::{Body, Hash, Header, MetaHeader, MiniBlock, ShardId, METACHAIN_SHARD_ID};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =============================================================================
// DATA REQUESTS
// =============================================================================

/// Fire-and-forget requests for data this node is missing.
///
/// Every call returns immediately. Suppressing duplicate requests for the
/// same key is the implementor's job.
pub trait RequestHandler: Send + Sync {
    /// Epoch used to route subsequent requests.
    fn set_epoch(&self, epoch: u32);

    fn request_shard_header(&self, shard: ShardId, hash: Hash);

    fn request_shard_header_by_nonce(&self, shard: ShardId, nonce: u64);

    fn request_meta_header(&self, hash: Hash);

    fn request_meta_header_by_nonce(&self, nonce: u64);

    /// Asks for the miniblocks a metachain header sends to this shard.
    fn request_mini_blocks(&self, meta_header: &MetaHeader);

    /// A header of `shard` arrived; requests for it are no longer pending.
    fn header_received(&self, _shard: ShardId, _nonce: u64, _hash: Hash) {}
}

/// Key of one data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    ShardHeader { shard: ShardId, hash: Hash },
    ShardHeaderByNonce { shard: ShardId, nonce: u64 },
    MetaHeader { hash: Hash },
    MetaHeaderByNonce { nonce: u64 },
    MiniBlock { sender: ShardId, hash: Hash },
}

impl RequestKind {
    /// Shard the request is sent to.
    pub fn target_shard(&self) -> ShardId {
        match self {
            RequestKind::ShardHeader { shard, .. } | RequestKind::ShardHeaderByNonce { shard, .. } => {
                *shard
            }
            RequestKind::MetaHeader { .. } | RequestKind::MetaHeaderByNonce { .. } => {
                METACHAIN_SHARD_ID
            }
            RequestKind::MiniBlock { sender, .. } => *sender,
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::ShardHeader { .. } => "shard_header",
            RequestKind::ShardHeaderByNonce { .. } => "shard_header_by_nonce",
            RequestKind::MetaHeader { .. } => "meta_header",
            RequestKind::MetaHeaderByNonce { .. } => "meta_header_by_nonce",
            RequestKind::MiniBlock { .. } => "mini_block",
        }
    }

    /// Issues this request through a [`RequestHandler`].
    ///
    /// Miniblocks are only requested per metachain header, so a single
    /// `MiniBlock` key has no handler call.
    pub fn send_to(&self, handler: &dyn RequestHandler) {
        match *self {
            RequestKind::ShardHeader { shard, hash } => handler.request_shard_header(shard, hash),
            RequestKind::ShardHeaderByNonce { shard, nonce } => {
                handler.request_shard_header_by_nonce(shard, nonce)
            }
            RequestKind::MetaHeader { hash } => handler.request_meta_header(hash),
            RequestKind::MetaHeaderByNonce { nonce } => handler.request_meta_header_by_nonce(nonce),
            RequestKind::MiniBlock { .. } => {}
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::ShardHeader { shard, hash } => {
                write!(f, "shard {shard} header {}", hex::encode(&hash[..8]))
            }
            RequestKind::ShardHeaderByNonce { shard, nonce } => {
                write!(f, "shard {shard} header nonce {nonce}")
            }
            RequestKind::MetaHeader { hash } => write!(f, "meta header {}", hex::encode(&hash[..8])),
            RequestKind::MetaHeaderByNonce { nonce } => write!(f, "meta header nonce {nonce}"),
            RequestKind::MiniBlock { sender, hash } => {
                write!(f, "miniblock {} from shard {sender}", hex::encode(&hash[..8]))
            }
        }
    }
}

/// One request as handed to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRequest {
    pub kind: RequestKind,
    pub epoch: u32,
}

/// Network side of the request dispatcher: performs one round trip.
#[async_trait]
pub trait NetworkRequester: Send + Sync {
    /// Sends the request and waits for the peer to acknowledge it.
    async fn send(&self, request: DataRequest) -> ProcessResult<()>;
}

// =============================================================================
// ACCOUNTS STATE
// =============================================================================

/// Which root of a commit a prune applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneDirection {
    /// Prune data only reachable from the previous root (normal commit).
    OldRoot,
    /// Prune data only reachable from the reverted root (rollback).
    NewRoot,
}

/// Merkle accounts state.
pub trait AccountsAdapter: Send + Sync {
    fn root_hash(&self) -> ProcessResult<Hash>;

    /// Persists pending changes and returns the new root.
    fn commit(&self) -> ProcessResult<Hash>;

    /// Number of uncommitted modifications.
    fn journal_len(&self) -> usize;

    fn revert_to_snapshot(&self, snapshot: usize) -> ProcessResult<()>;

    /// Rebuilds the trie at `root`.
    fn recreate_trie(&self, root: &Hash) -> ProcessResult<()>;

    fn snapshot_state(&self, root: &Hash);

    fn set_state_checkpoint(&self, root: &Hash);

    fn prune_trie(&self, root: &Hash, direction: PruneDirection);

    fn cancel_prune(&self, root: &Hash, direction: PruneDirection);

    fn is_pruning_enabled(&self) -> bool;
}

// =============================================================================
// TRANSACTION EXECUTION
// =============================================================================

/// Result of one cross-shard miniblock selection pass over a metachain header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossShardOutcome {
    pub mini_blocks: Vec<MiniBlock>,
    pub txs_added: u32,
    /// Every miniblock of the header destined to this shard was processed.
    pub finished: bool,
}

/// Transaction selection and execution.
#[async_trait]
pub trait TransactionCoordinator: Send + Sync {
    /// Clears per-block state.
    fn create_block_started(&self);

    /// Starts fetching transactions referenced by `body`.
    fn request_block_transactions(&self, body: &Body);

    /// Waits until every transaction of the last requested body is present.
    async fn is_data_prepared_for_processing(&self, deadline: Deadline) -> ProcessResult<()>;

    /// Executes `body` against the accounts state.
    fn process_block_transactions(&self, body: &Body, deadline: Deadline) -> ProcessResult<()>;

    /// Checks the intermediate results created while executing `body`.
    fn verify_created_block_transactions(&self, body: &Body) -> ProcessResult<()>;

    /// Fees collected by the last executed body.
    fn accumulated_fees(&self) -> u128;

    fn create_receipts_hash(&self) -> ProcessResult<Hash>;

    /// Selects and executes miniblocks of `meta_header` destined to this shard.
    ///
    /// Miniblocks listed in `processed` are skipped.
    fn create_mbs_and_process_cross_shard_transactions_dst_me(
        &self,
        meta_header: &MetaHeader,
        processed: &BTreeSet<Hash>,
        deadline: Deadline,
    ) -> ProcessResult<CrossShardOutcome>;

    /// Selects and executes transactions originating in this shard.
    fn create_mbs_and_process_transactions_from_me(&self, deadline: Deadline) -> Vec<MiniBlock>;

    /// Drops executed transactions and miniblocks from the data pools.
    fn remove_block_data_from_pool(&self, body: &Body) -> ProcessResult<()>;

    /// Moves the body's transactions back into the data pools.
    ///
    /// Returns how many transactions were restored.
    fn restore_block_data_from_storage(&self, body: &Body) -> ProcessResult<usize>;

    /// Encoded transactions of `body`, grouped by topic.
    fn create_marshalized_data(&self, body: &Body) -> BTreeMap<String, Vec<Vec<u8>>>;
}

// =============================================================================
// EPOCH START / FORK DETECTION / NODES COORDINATOR
// =============================================================================

pub trait EpochStartTrigger: Send + Sync {
    fn epoch(&self) -> u32;

    /// True between seeing an epoch-start metachain header and processing it.
    fn is_epoch_start(&self) -> bool;

    fn epoch_start_round(&self) -> u64;

    fn epoch_finality_attesting_round(&self) -> u64;

    fn epoch_start_meta_hdr_hash(&self) -> Hash;

    fn received_header(&self, header: &MetaHeader);

    /// Marks the epoch start as processed by `header`.
    fn set_processed(&self, header: &Header);

    fn revert_state_to_block(&self, header: &Header) -> ProcessResult<()>;

    /// Restore point key for bootstrap data.
    fn saved_state_key(&self) -> Vec<u8>;
}

pub trait ForkDetector: Send + Sync {
    fn add_header(&self, header: &Header, hash: &Hash) -> ProcessResult<()>;

    fn set_rollback_nonce(&self, nonce: u64);

    fn highest_final_block_nonce(&self) -> u64;

    fn highest_final_block_hash(&self) -> Hash;
}

pub trait NodesCoordinator: Send + Sync {
    fn saved_state_key(&self) -> Vec<u8>;
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Persisted unit a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitType {
    /// Shard header by hash.
    BlockHeader,
    /// Metachain header by hash.
    MetaBlock,
    /// Shard header hash by nonce.
    ShardHdrNonceHash(ShardId),
    /// Metachain header hash by nonce.
    MetaHdrNonceHash,
    /// Miniblock by hash.
    MiniBlock,
    /// Bootstrap data by round.
    Bootstrap,
}

/// Content-addressed key/value units.
pub trait StorageService: Send + Sync {
    fn put(&self, unit: UnitType, key: &[u8], value: Vec<u8>) -> ProcessResult<()>;

    /// `NotFound` when the key is absent.
    fn get(&self, unit: UnitType, key: &[u8]) -> ProcessResult<Vec<u8>>;

    fn has(&self, unit: UnitType, key: &[u8]) -> bool;

    fn remove(&self, unit: UnitType, key: &[u8]) -> ProcessResult<()>;
}

/// Bootstrap data keyed by round.
pub trait BootstrapStorer: Send + Sync {
    fn put(&self, round: u64, data: &BootstrapData) -> ProcessResult<()>;

    fn get(&self, round: u64) -> ProcessResult<BootstrapData>;

    /// Round of the latest successful `put`.
    fn highest_round(&self) -> Option<u64>;
}

/// Nonce key used by the nonce-to-hash units.
pub fn nonce_key(nonce: u64) -> [u8; 8] {
    nonce.to_be_bytes()
}

/// Key under which the epoch-start metachain header of `epoch` is stored in
/// the `MetaBlock` unit.
pub fn epoch_start_identifier(epoch: u32) -> String {
    format!("epochStartBlock_{epoch}")
}
