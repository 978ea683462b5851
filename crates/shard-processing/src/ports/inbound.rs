//! # Inbound Ports (Driving Ports)
//!
//! The API consensus and sync drive the shard block processor through.

use crate::domain::{BootstrapData, Deadline};
use crate::error::ProcessResult;
use async_trait::async_trait;
use shared_types::{Body, Hash, Header, MetaHeader, ShardHeader, ShardId};
use std::collections::BTreeMap;

/// Per-destination encoded bodies plus encoded transactions by topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastData {
    pub bodies: BTreeMap<ShardId, Vec<u8>>,
    pub transactions: BTreeMap<String, Vec<Vec<u8>>>,
}

/// Block lifecycle of one shard.
///
/// Calls for the same shard must be serialized by the caller: a block of
/// nonce N+1 is never processed while nonce N is still in flight.
#[async_trait]
pub trait BlockProcessor: Send + Sync {
    /// Validates and executes a proposed block.
    ///
    /// ## Errors
    ///
    /// - Structural (`WrongNonceInBlock`, `BlockHashDoesNotMatch`, ...): block
    ///   does not extend the local chain
    /// - `TimeIsOut` / `HeaderNotFinal`: referenced data not available yet, retry
    /// - `CrossShardMbWithoutConfirmationFromMeta`: unconfirmed cross-shard data
    ///
    /// Accounts state is reverted on every error.
    async fn process_block(&self, header: &Header, body: &Body, deadline: Deadline)
        -> ProcessResult<()>;

    /// Builds a block on top of the current one.
    ///
    /// `initial` carries the consensus fields (nonce, round, prev hash, seeds).
    async fn create_block(&self, initial: ShardHeader, deadline: Deadline)
        -> ProcessResult<(ShardHeader, Body)>;

    /// Persists an executed block and advances the notarization state.
    async fn commit_block(&self, header: &Header, body: &Body) -> ProcessResult<()>;

    /// Drops uncommitted accounts changes.
    fn revert_account_state(&self);

    /// Rebuilds accounts state at `header`'s root.
    fn revert_state_to_block(&self, header: &Header) -> ProcessResult<()>;

    /// Undoes the commit-time prune of `current` after rolling back to `previous`.
    fn prune_state_on_rollback(&self, current: &Header, previous: &Header);

    /// Puts a rolled-back block's data back into the pools.
    fn restore_block_into_pools(&self, header: &Header, body: &Body) -> ProcessResult<()>;

    /// Encoded body parts for every other shard plus transaction data.
    fn marshalized_data_to_broadcast(&self, body: &Body) -> ProcessResult<BroadcastData>;

    /// Body of `header` assembled from the miniblocks pool.
    fn get_block_body_from_pool(&self, header: &Header) -> ProcessResult<Body>;

    /// Resumes state from persisted bootstrap data.
    fn restore_from_bootstrap(&self, data: &BootstrapData) -> ProcessResult<()>;

    /// A metachain header arrived from the network.
    fn on_meta_header_received(&self, header: MetaHeader, hash: Hash);
}
