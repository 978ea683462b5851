//! Rollback of a committed block into the pools, and resuming from
//! bootstrap data after a restart.

use super::ShardBlockProcessor;
use crate::domain::{BootstrapData, BootstrapHeaderInfo};
use crate::error::{ProcessError, ProcessResult};
use crate::ports::{nonce_key, UnitType};
use crate::service::base::log_not_critical;
use shared_types::{short_hex, unmarshal, Body, Hash, Header, HeaderHandler, MiniBlock, METACHAIN_SHARD_ID};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace};

impl ShardBlockProcessor {
    /// Puts the metachain headers `header` consumed back into the pool and
    /// undoes its processed miniblock bookkeeping.
    pub(crate) fn restore_block_into_pools_inner(&self, header: &Header, body: &Body) -> ProcessResult<()> {
        let shard_header = header.as_shard().ok_or(ProcessError::WrongTypeAssertion {
            expected: "shard header",
        })?;

        let mut restored: BTreeMap<Hash, Vec<Hash>> = BTreeMap::new();
        for meta_hash in &shard_header.meta_block_hashes {
            let meta = match self.get_meta_header_from_storage(meta_hash) {
                Ok(meta) => meta,
                Err(_) => {
                    debug!(hash = %short_hex(meta_hash), "meta block is not fully processed yet and not committed");
                    continue;
                }
            };

            restored.insert(
                *meta_hash,
                meta.mini_block_headers_with_dst(self.config.self_shard_id)
                    .into_keys()
                    .collect(),
            );

            let restored_header = Header::Meta(meta.clone());
            self.data_pool.headers.add(*meta_hash, restored_header.clone());
            self.block_tracker.add_tracked_header(restored_header, *meta_hash);

            self.storage.remove(UnitType::MetaBlock, meta_hash)?;
            log_not_critical(
                "remove_meta_nonce",
                self.storage.remove(UnitType::MetaHdrNonceHash, &nonce_key(meta.nonce)),
            );
            trace!(round = meta.round, nonce = meta.nonce, hash = %short_hex(meta_hash), "meta block has been restored");
        }

        {
            let mut processed_mb = self.processed_mini_blocks.lock();
            for (meta_hash, mb_hashes) in restored {
                for mb_hash in mb_hashes {
                    processed_mb.add_mini_block_hash(meta_hash, mb_hash);
                }
            }
            for mb_hash in shard_header.map_mini_block_hashes_to_shards().keys() {
                processed_mb.remove_mini_block_hash(mb_hash);
            }
        }

        if let Some(restored_txs) = log_not_critical(
            "restore_block_data_from_storage",
            self.tx_coordinator.restore_block_data_from_storage(body),
        ) {
            debug!(restored_txs, nonce = shard_header.nonce, "block data restored into pools");
        }
        Ok(())
    }

    pub(crate) fn revert_state_to_block_inner(&self, header: &Header) -> ProcessResult<()> {
        if let Err(e) = self.accounts.recreate_trie(header.root_hash()) {
            debug!(nonce = header.nonce(), root = %short_hex(header.root_hash()), error = %e, "recreate trie");
            return Err(e);
        }
        if let Err(e) = self.epoch_start_trigger.revert_state_to_block(header) {
            debug!(nonce = header.nonce(), error = %e, "revert epoch start trigger");
            return Err(e);
        }
        Ok(())
    }

    /// Body of a shard header from whatever miniblocks the pool holds.
    pub(crate) fn block_body_from_pool(&self, header: &Header) -> ProcessResult<Body> {
        let shard_header = header.as_shard().ok_or(ProcessError::WrongTypeAssertion {
            expected: "shard header",
        })?;
        let mini_blocks = shard_header
            .mini_block_headers
            .iter()
            .filter_map(|mbh| self.data_pool.mini_blocks.get(&mbh.hash))
            .collect();
        Ok(Body::new(mini_blocks))
    }

    fn block_body_from_storage(&self, header: &Header) -> ProcessResult<Body> {
        let mut mini_blocks = Vec::with_capacity(header.mini_block_headers().len());
        for mbh in header.mini_block_headers() {
            let bytes = self.storage.get(UnitType::MiniBlock, &mbh.hash)?;
            mini_blocks.push(unmarshal::<MiniBlock>(&bytes)?);
        }
        Ok(Body::new(mini_blocks))
    }

    fn notarized_header(&self, info: &BootstrapHeaderInfo) -> ProcessResult<Header> {
        if info.shard_id == METACHAIN_SHARD_ID {
            if let Some(found @ Header::Meta(_)) = self.data_pool.headers.get(&info.hash) {
                return Ok(found);
            }
            return Ok(Header::Meta(self.get_meta_header_from_storage(&info.hash)?));
        }
        Ok(Header::Shard(self.get_shard_header(&info.hash)?))
    }

    /// Restores chain head, notarization anchors and processed miniblocks
    /// from the data written by an earlier commit.
    pub(crate) fn restore_from_bootstrap_inner(&self, data: &BootstrapData) -> ProcessResult<()> {
        for info in &data.last_cross_notarized_headers {
            let header = self.notarized_header(info)?;
            self.block_tracker
                .add_cross_notarized_header(info.shard_id, header, info.hash);
        }

        for info in &data.last_self_notarized_headers {
            let header = self.notarized_header(info)?;
            self.block_tracker
                .add_self_notarized_header(METACHAIN_SHARD_ID, header, info.hash);
        }

        if let Some(last) = &data.last_header {
            let header = Header::Shard(self.get_shard_header(&last.hash)?);
            let body = self.block_body_from_storage(&header)?;
            self.block_tracker
                .add_self_notarized_header(self.config.self_shard_id, header.clone(), last.hash);
            self.chain.set_current(header, last.hash, body);
        }

        self.processed_mini_blocks
            .lock()
            .restore_from_slice(&data.processed_mini_blocks);
        self.lowest_nonce_in_self_notarized
            .store(data.highest_final_block_nonce, Ordering::Relaxed);

        info!(
            nonce = data.last_header.map_or(0, |h| h.nonce),
            cross_notarized = data.last_cross_notarized_headers.len(),
            processed_meta_blocks = data.processed_mini_blocks.len(),
            "state restored from bootstrap data"
        );
        Ok(())
    }
}
