//! Logic every block processor needs regardless of its shard: structural
//! validity, state root, gap and finality requests, pool cleanup, state
//! storage policy and bootstrap persistence.

use super::ShardBlockProcessor;
use crate::domain::{
    BlockTracker, BootstrapData, BootstrapHeaderInfo, InFlightHeaders, TrackedHeader,
};
use crate::error::{ProcessError, ProcessResult};
use crate::metrics;
use crate::ports::{epoch_start_identifier, nonce_key, PruneDirection, UnitType};
use shared_types::{
    calculate_hash, header_hash, marshal, short_hex, unmarshal, Body, Hash, Header,
    HeaderHandler, MetaHeader, ShardHeader, ShardId, EMPTY_HASH, METACHAIN_SHARD_ID,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Logs and drops the error of a housekeeping step.
///
/// Housekeeping never decides the outcome of a block; this is the only
/// place its failures end up.
pub(crate) fn log_not_critical<T>(operation: &'static str, result: ProcessResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            metrics::record_housekeeping_failure(operation);
            debug!(operation, error = %e, "not critical step failed");
            None
        }
    }
}

/// Registers the tracked headers attesting finality for `shard` above the
/// highest referenced nonce and returns the nonces nothing is known for.
pub(crate) fn register_finality_attesting_headers(
    state: &mut InFlightHeaders,
    tracker: &BlockTracker,
    shard: ShardId,
    finality: u32,
) -> Vec<u64> {
    let highest = state.highest_nonce(shard);
    if highest == 0 {
        return Vec::new();
    }

    let mut missing = Vec::new();
    for nonce in highest + 1..=highest + u64::from(finality) {
        let tracked = tracker.tracked_headers_with_nonce(shard, nonce);
        if tracked.is_empty() {
            missing.push(nonce);
            continue;
        }
        for t in tracked {
            state.register_reference(t.hash, Some(t.header), false);
        }
    }
    missing
}

impl ShardBlockProcessor {
    // =========================================================================
    // VALIDITY
    // =========================================================================

    /// The shard header inside `header`, if it belongs to this shard.
    pub(crate) fn own_shard_header<'a>(&self, header: &'a Header) -> ProcessResult<&'a ShardHeader> {
        let shard_header = header.as_shard().ok_or(ProcessError::WrongTypeAssertion {
            expected: "shard header",
        })?;
        if shard_header.shard_id != self.config.self_shard_id {
            return Err(ProcessError::ShardIdMismatch {
                expected: self.config.self_shard_id,
                actual: shard_header.shard_id,
            });
        }
        Ok(shard_header)
    }

    /// Checks that `header` extends the local chain.
    ///
    /// Right after genesis only nonce 1 on top of the genesis hash passes.
    /// Otherwise: round, nonce, previous hash, previous random seed and a
    /// non-decreasing epoch, in that order.
    pub(crate) fn check_block_validity(&self, header: &Header) -> ProcessResult<()> {
        let Some(current) = self.chain.current_header() else {
            if header.nonce() == 1 {
                if *header.prev_hash() == self.chain.genesis_hash() {
                    return Ok(());
                }
                debug!(
                    local = %short_hex(&self.chain.genesis_hash()),
                    received = %short_hex(header.prev_hash()),
                    "hash does not match"
                );
                return Err(ProcessError::BlockHashDoesNotMatch);
            }
            debug!(local = 0, received = header.nonce(), "nonce does not match");
            return Err(ProcessError::WrongNonceInBlock {
                expected: 1,
                actual: header.nonce(),
            });
        };

        if header.round() <= current.round() {
            debug!(local = current.round(), received = header.round(), "round does not match");
            return Err(ProcessError::LowerRoundInBlock {
                local: current.round(),
                received: header.round(),
            });
        }

        if header.nonce() != current.nonce() + 1 {
            debug!(local = current.nonce(), received = header.nonce(), "nonce does not match");
            return Err(ProcessError::WrongNonceInBlock {
                expected: current.nonce() + 1,
                actual: header.nonce(),
            });
        }

        let prev_hash = header_hash(&current)?;
        if *header.prev_hash() != prev_hash {
            debug!(
                local = %short_hex(&prev_hash),
                received = %short_hex(header.prev_hash()),
                "hash does not match"
            );
            return Err(ProcessError::BlockHashDoesNotMatch);
        }

        if header.prev_rand_seed() != current.rand_seed() {
            debug!("random seed does not match");
            return Err(ProcessError::RandSeedDoesNotMatch);
        }

        if header.epoch() < current.epoch() {
            return Err(ProcessError::epoch_mismatch(format!(
                "header epoch {} behind blockchain epoch {}",
                header.epoch(),
                current.epoch()
            )));
        }

        Ok(())
    }

    /// Accounts root, or the empty hash if the adapter cannot report one.
    pub(crate) fn root_hash(&self) -> Hash {
        match self.accounts.root_hash() {
            Ok(root) => root,
            Err(e) => {
                trace!(error = %e, "accounts root hash");
                EMPTY_HASH
            }
        }
    }

    /// True if the accounts root equals `root`.
    pub(crate) fn verify_state_root(&self, root: &Hash) -> bool {
        match self.accounts.root_hash() {
            Ok(current) => current == *root,
            Err(e) => {
                debug!(error = %e, "verify accounts root hash");
                false
            }
        }
    }

    pub(crate) fn revert_accounts(&self) {
        if let Err(e) = self.accounts.revert_to_snapshot(0) {
            debug!(error = %e, "revert to snapshot");
        }
    }

    pub(crate) fn commit_all(&self) -> ProcessResult<Hash> {
        self.accounts.commit()
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    pub(crate) fn request_header_by_shard_and_nonce(&self, shard: ShardId, nonce: u64) {
        if shard == METACHAIN_SHARD_ID {
            self.request_handler.request_meta_header_by_nonce(nonce);
        } else {
            self.request_handler.request_shard_header_by_nonce(shard, nonce);
        }
    }

    pub(crate) fn request_headers_by_nonce(&self, shard: ShardId, nonces: &[u64]) {
        for nonce in nonces {
            self.request_header_by_shard_and_nonce(shard, *nonce);
        }
        if !nonces.is_empty() {
            debug!(shard, num_headers = nonces.len(), "requested missing finality attesting headers");
        }
    }

    /// Requests the nonces missing between consecutive `sorted` headers,
    /// starting from the last cross-notarized header of `shard`.
    ///
    /// Headers newer than `max_round` are skipped. At most
    /// `max_header_requests_allowed` requests go out, none beyond the range
    /// the headers pool may hold. Returns the requested nonces.
    pub(crate) fn request_headers_if_missing(
        &self,
        sorted: &[TrackedHeader],
        shard: ShardId,
        max_round: u64,
    ) -> ProcessResult<Vec<u64>> {
        let anchor = self.block_tracker.get_last_cross_notarized(shard)?;
        let allowed = self.config.allowed_headers_ahead();

        let mut missing = Vec::new();
        let mut prev = &anchor.header;
        for (i, current) in sorted.iter().enumerate() {
            if i > 0 {
                prev = &sorted[i - 1].header;
            }
            if current.header.round() > max_round || prev.round() > max_round {
                continue;
            }
            missing.extend(prev.nonce() + 1..current.nonce());
        }

        let mut requested = Vec::new();
        for nonce in missing {
            if nonce > anchor.nonce() + allowed {
                break;
            }
            if requested.len() >= self.config.max_header_requests_allowed {
                break;
            }
            self.request_header_by_shard_and_nonce(shard, nonce);
            requested.push(nonce);
        }

        if !requested.is_empty() {
            debug!(shard, ?requested, "requested missing headers");
        }
        Ok(requested)
    }

    /// Finality attesting headers for `shard`: registers the tracked ones,
    /// stores the missing count in `state` and returns the nonces to request
    /// once the lock is released.
    pub(crate) fn missing_finality_attesting_headers(
        &self,
        state: &mut InFlightHeaders,
        shard: ShardId,
    ) -> Vec<u64> {
        let missing = register_finality_attesting_headers(
            state,
            &self.block_tracker,
            shard,
            self.config.meta_block_finality,
        );
        state.set_missing_finality_attesting(missing.len() as u32);
        missing
    }

    // =========================================================================
    // POOL CLEANUP
    // =========================================================================

    /// Evicts headers below the final nonce of this shard and below the
    /// cross-notarized nonce of every other shard and the metachain.
    pub(crate) fn cleanup_pools(&self) {
        let self_shard = self.config.self_shard_id;
        self.remove_headers_behind_nonce_from_pools(
            true,
            self_shard,
            self.fork_detector.highest_final_block_nonce(),
        );

        for shard in (0..self.config.number_of_shards).filter(|s| *s != self_shard) {
            self.cleanup_pools_for_shard(shard);
        }
        self.cleanup_pools_for_shard(METACHAIN_SHARD_ID);
    }

    fn cleanup_pools_for_shard(&self, shard: ShardId) {
        let Ok(anchor) = self.block_tracker.get_last_cross_notarized(shard) else {
            return;
        };
        self.remove_headers_behind_nonce_from_pools(false, shard, anchor.nonce());
    }

    fn remove_headers_behind_nonce_from_pools(&self, remove_body: bool, shard: ShardId, nonce: u64) {
        if nonce <= 1 {
            return;
        }
        let removed = self.data_pool.headers.remove_behind_nonce(shard, nonce);
        if remove_body {
            for (_, header) in &removed {
                log_not_critical("remove_block_body", self.remove_block_body_of_header(header));
            }
        }
        if !removed.is_empty() {
            trace!(shard, nonce, removed = removed.len(), "headers removed from pool");
        }
    }

    fn remove_block_body_of_header(&self, header: &Header) -> ProcessResult<()> {
        let body = self.block_body_from_pool(header)?;
        self.tx_coordinator.remove_block_data_from_pool(&body)
    }

    /// Drops tracker candidates that fell behind the final nonces.
    ///
    /// The cross-notarized nonce of every shard is lowered by the distance
    /// between the current and the final block of this shard.
    pub(crate) fn cleanup_block_tracker_pools(&self) {
        let current_nonce = self.chain.current_header().map_or(0, |h| h.nonce());
        let final_nonce = self.fork_detector.highest_final_block_nonce();
        let nonces_to_final = current_nonce.saturating_sub(final_nonce);

        let shards = (0..self.config.number_of_shards).chain(std::iter::once(METACHAIN_SHARD_ID));
        for shard in shards {
            let Ok(anchor) = self.block_tracker.get_last_cross_notarized(shard) else {
                continue;
            };
            self.block_tracker.cleanup_headers_behind_nonce(
                shard,
                final_nonce,
                anchor.nonce().saturating_sub(nonces_to_final),
            );
        }
    }

    // =========================================================================
    // STATE STORAGE
    // =========================================================================

    /// Commit-time trie policy for a final header.
    ///
    /// Checkpoint every `state_checkpoint_modulus` nonces, then prune what
    /// only the previous root still reaches.
    pub(crate) fn update_state_storage(&self, header: &Header, root: &Hash, prev_root: &Hash) {
        if !self.accounts.is_pruning_enabled() {
            return;
        }

        let modulus = self.config.state_checkpoint_modulus;
        if modulus != 0 && header.nonce() % modulus == 0 {
            debug!(nonce = header.nonce(), root = %short_hex(root), "state checkpoint");
            self.accounts.set_state_checkpoint(root);
        }

        if root == prev_root {
            return;
        }
        self.accounts.cancel_prune(prev_root, PruneDirection::NewRoot);
        self.accounts.prune_trie(prev_root, PruneDirection::OldRoot);
    }

    /// Inverse of [`update_state_storage`](Self::update_state_storage) after
    /// `current` was rolled back to `previous`.
    pub(crate) fn prune_state_on_rollback_inner(&self, current: &Header, previous: &Header) {
        if !self.accounts.is_pruning_enabled() {
            return;
        }
        if current.root_hash() == previous.root_hash() {
            return;
        }
        self.accounts.cancel_prune(previous.root_hash(), PruneDirection::OldRoot);
        self.accounts.prune_trie(current.root_hash(), PruneDirection::NewRoot);
    }

    /// Snapshots the trie at the root the epoch-start metachain header
    /// recorded for this shard.
    pub(crate) fn snapshot_epoch_start_from_meta(&self, header: &ShardHeader) {
        if !self.accounts.is_pruning_enabled() || !header.is_start_of_epoch() {
            return;
        }

        let key = epoch_start_identifier(header.epoch);
        let meta = match self.get_meta_header_from_storage(key.as_bytes()) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(epoch = header.epoch, error = %e, "could not find epoch start metablock");
                return;
            }
        };

        let shard_data = meta
            .epoch_start
            .iter()
            .flat_map(|es| es.last_finalized_headers.iter())
            .find(|sd| sd.shard_id == header.shard_id);
        match shard_data {
            Some(sd) => {
                self.accounts.cancel_prune(&sd.root_hash, PruneDirection::NewRoot);
                debug!(root = %short_hex(&sd.root_hash), "shard trie snapshot from epoch start shard data");
                self.accounts.snapshot_state(&sd.root_hash);
            }
            None => warn!(epoch = header.epoch, "could not find epoch start shard data in metablock"),
        }
    }

    // =========================================================================
    // PERSISTED UNITS
    // =========================================================================

    pub(crate) fn get_shard_header_from_storage(&self, hash: &Hash) -> ProcessResult<ShardHeader> {
        let bytes = self.storage.get(UnitType::BlockHeader, hash)?;
        Ok(unmarshal(&bytes)?)
    }

    pub(crate) fn get_meta_header_from_storage(&self, key: &[u8]) -> ProcessResult<MetaHeader> {
        let bytes = self.storage.get(UnitType::MetaBlock, key)?;
        Ok(unmarshal(&bytes)?)
    }

    /// Shard header by hash from genesis, the headers pool or storage.
    pub(crate) fn get_shard_header(&self, hash: &Hash) -> ProcessResult<ShardHeader> {
        if *hash == self.chain.genesis_hash() {
            if let Some(genesis) = self.chain.genesis_header().as_shard() {
                return Ok(genesis.clone());
            }
        }
        if let Some(Header::Shard(header)) = self.data_pool.headers.get(hash) {
            return Ok(header);
        }
        self.get_shard_header_from_storage(hash)
    }

    pub(crate) fn save_shard_header(&self, header: &ShardHeader, hash: &Hash) -> ProcessResult<()> {
        self.storage
            .put(UnitType::BlockHeader, hash, marshal(header)?)?;
        self.storage.put(
            UnitType::ShardHdrNonceHash(header.shard_id),
            &nonce_key(header.nonce),
            hash.to_vec(),
        )
    }

    pub(crate) fn save_body(&self, body: &Body) -> ProcessResult<()> {
        for mini_block in &body.mini_blocks {
            let hash = calculate_hash(mini_block)?;
            self.storage
                .put(UnitType::MiniBlock, &hash, marshal(mini_block)?)?;
        }
        Ok(())
    }

    /// Persists a metachain header; epoch-start ones also under their
    /// epoch-start key.
    pub(crate) fn save_meta_header(&self, meta: &MetaHeader, hash: &Hash) -> ProcessResult<()> {
        let bytes = marshal(meta)?;
        if meta.is_start_of_epoch() {
            let key = epoch_start_identifier(meta.epoch);
            self.storage
                .put(UnitType::MetaBlock, key.as_bytes(), bytes.clone())?;
        }
        self.storage.put(UnitType::MetaBlock, hash, bytes)?;
        self.storage
            .put(UnitType::MetaHdrNonceHash, &nonce_key(meta.nonce), hash.to_vec())
    }

    // =========================================================================
    // BOOTSTRAP
    // =========================================================================

    fn last_cross_notarized_headers_info(&self) -> Vec<BootstrapHeaderInfo> {
        self.block_tracker
            .cross_notarized_anchors()
            .into_iter()
            .filter(|(_, anchor)| anchor.nonce() > 0)
            .map(|(shard, anchor)| BootstrapHeaderInfo {
                shard_id: shard,
                nonce: anchor.nonce(),
                hash: anchor.hash,
            })
            .collect()
    }

    pub(crate) fn prepare_bootstrap_data(
        &self,
        last_header: BootstrapHeaderInfo,
        self_notarized: &[TrackedHeader],
    ) -> BootstrapData {
        BootstrapData {
            last_header: Some(last_header),
            last_cross_notarized_headers: self.last_cross_notarized_headers_info(),
            last_self_notarized_headers: self_notarized
                .iter()
                .map(|t| BootstrapHeaderInfo {
                    shard_id: t.header.shard_id(),
                    nonce: t.nonce(),
                    hash: t.hash,
                })
                .collect(),
            highest_final_block_nonce: self.lowest_nonce_in_self_notarized.load(Ordering::Relaxed),
            processed_mini_blocks: self.processed_mini_blocks.lock().to_slice(),
            nodes_coordinator_config_key: self.nodes_coordinator.saved_state_key(),
            epoch_start_trigger_config_key: self.epoch_start_trigger.saved_state_key(),
        }
    }

    /// Writes bootstrap data in the background, after the previous write.
    pub(crate) fn persist_bootstrap(&self, round: u64, data: BootstrapData) {
        let storer = Arc::clone(&self.bootstrap_storer);
        let mut slot = self.bootstrap_task.lock();
        let previous = slot.take();
        *slot = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if log_not_critical("bootstrap_persist", storer.put(round, &data)).is_none() {
                warn!(round, "cannot save boot data in storage");
            }
        }));
    }
}
