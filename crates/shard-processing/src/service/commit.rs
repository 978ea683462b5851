//! Commit of an executed block and the notarization bookkeeping around it.

use super::ShardBlockProcessor;
use crate::domain::{BootstrapHeaderInfo, TrackedHeader};
use crate::error::{ProcessError, ProcessResult};
use crate::metrics;
use crate::service::base::log_not_critical;
use shared_types::{
    calculate_hash, short_hex, Body, Hash, Header, HeaderHandler, MetaHeader, ShardHeader, ShardId,
    METACHAIN_SHARD_ID,
};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace, warn};

impl ShardBlockProcessor {
    pub(crate) async fn commit_block_inner(&self, header: &Header, body: &Body) -> ProcessResult<()> {
        debug!(
            epoch = header.epoch(),
            round = header.round(),
            nonce = header.nonce(),
            "started committing block"
        );

        self.check_block_validity(header)?;
        let shard_header = self.own_shard_header(header)?;

        if shard_header.is_start_of_epoch() {
            self.check_epoch_correctness_cross_chain()?;
            self.epoch_start_trigger.set_processed(header);
        }

        let header_hash = calculate_hash(shard_header)?;
        log_not_critical("save_shard_header", self.save_shard_header(shard_header, &header_hash));
        log_not_critical("save_body", self.save_body(body));

        let processed_metas = self.ordered_processed_meta_blocks(shard_header)?;
        let cross_processed = self.cross_mini_blocks_from_header(shard_header)?;
        let self_notarized = self.highest_headers_for_own_shard_from_metachain(&processed_metas)?;
        self.commit_all()?;

        // Processed miniblocks and the anchor change only after every fallible step.
        self.record_processed_mini_blocks(cross_processed);
        self.save_last_notarized_header(METACHAIN_SHARD_ID, &processed_metas);

        info!(
            epoch = shard_header.epoch,
            round = shard_header.round,
            nonce = shard_header.nonce,
            shard = shard_header.shard_id,
            hash = %short_hex(&header_hash),
            "shard block has been committed successfully"
        );

        log_not_critical(
            "remove_block_data_from_pool",
            self.tx_coordinator.remove_block_data_from_pool(body),
        );
        log_not_critical(
            "remove_processed_meta_blocks",
            self.remove_processed_meta_blocks_from_pool(&processed_metas),
        );
        log_not_critical("fork_detector_add_header", self.fork_detector.add_header(header, &header_hash));

        let (last_self, last_self_hash) = self.chain.current_or_genesis();
        self.block_tracker
            .add_self_notarized_header(self.config.self_shard_id, last_self, last_self_hash);
        if let Some((by_meta, by_meta_hash)) = self.last_self_notarized_header_by_metachain() {
            self.block_tracker
                .add_self_notarized_header(METACHAIN_SHARD_ID, by_meta, by_meta_hash);
        }

        self.update_state(&self_notarized, shard_header);

        let highest_final = self.fork_detector.highest_final_block_nonce();
        debug!(nonce = highest_final, shard = self.config.self_shard_id, "highest final shard block");

        self.chain.set_current(header.clone(), header_hash, body.clone());

        metrics::record_committed(shard_header.nonce);
        if let Ok(anchor) = self.block_tracker.get_last_cross_notarized(METACHAIN_SHARD_ID) {
            metrics::record_last_cross_notarized_meta(anchor.nonce());
        }

        if let Some(first) = self_notarized.first() {
            self.lowest_nonce_in_self_notarized
                .store(first.nonce(), Ordering::Relaxed);
        }
        let last_header = BootstrapHeaderInfo {
            shard_id: shard_header.shard_id,
            nonce: shard_header.nonce,
            hash: header_hash,
        };
        let data = self.prepare_bootstrap_data(last_header, &self_notarized);
        self.persist_bootstrap(shard_header.round, data);

        debug!(
            headers = self.data_pool.headers.len(),
            headers_capacity = self.data_pool.headers.capacity(),
            mini_blocks = self.data_pool.mini_blocks.len(),
            "pools info"
        );

        self.cleanup_block_tracker_pools();
        self.cleanup_pools();
        Ok(())
    }

    /// Referenced metachain headers whose miniblocks for this shard are all
    /// processed, by this block or earlier ones, sorted by nonce.
    pub(crate) fn ordered_processed_meta_blocks(
        &self,
        header: &ShardHeader,
    ) -> ProcessResult<Vec<(Hash, MetaHeader)>> {
        let self_shard = self.config.self_shard_id;
        let mut in_block: BTreeSet<Hash> = header.mini_block_headers.iter().map(|mbh| mbh.hash).collect();
        trace!(num_mini_blocks = in_block.len(), "cross miniblocks in body");

        let used = self.in_flight.with(|state| state.sorted_by_nonce(true));
        let processed_mb = self.processed_mini_blocks.lock();

        let mut processed = Vec::new();
        for (meta_hash, found) in used.into_values().flatten() {
            let meta = found.as_meta().ok_or(ProcessError::WrongTypeAssertion {
                expected: "meta header",
            })?;

            let mut processed_all = true;
            for mb_hash in meta.mini_block_headers_with_dst(self_shard).keys() {
                let in_this_block = in_block.remove(mb_hash);
                if !in_this_block && !processed_mb.is_mini_block_processed(&meta_hash, mb_hash) {
                    processed_all = false;
                }
            }
            if processed_all {
                processed.push((meta_hash, meta.clone()));
            }
        }

        processed.sort_by_key(|(_, meta)| meta.nonce);
        Ok(processed)
    }

    /// Cross-shard miniblocks of `header`, each paired with the referenced
    /// metachain header confirming it, as `(meta hash, miniblock hash)`.
    pub(crate) fn cross_mini_blocks_from_header(&self, header: &ShardHeader) -> ProcessResult<Vec<(Hash, Hash)>> {
        let metas = self.in_flight.with(|state| {
            header
                .meta_block_hashes
                .iter()
                .map(|hash| -> ProcessResult<(Hash, MetaHeader)> {
                    let info = state.get(hash).ok_or(ProcessError::MissingHeader)?;
                    let meta = info
                        .header
                        .as_ref()
                        .and_then(Header::as_meta)
                        .ok_or(ProcessError::WrongTypeAssertion {
                            expected: "meta header",
                        })?;
                    Ok((*hash, meta.clone()))
                })
                .collect::<ProcessResult<Vec<_>>>()
        })?;

        let self_shard = self.config.self_shard_id;
        let mut in_block: BTreeSet<Hash> = header.mini_block_headers.iter().map(|mbh| mbh.hash).collect();
        let mut pairs = Vec::new();
        for (meta_hash, meta) in metas {
            let cross = meta.mini_block_headers_with_dst(self_shard);
            in_block.retain(|mb_hash| {
                if cross.contains_key(mb_hash) {
                    pairs.push((meta_hash, *mb_hash));
                    false
                } else {
                    true
                }
            });
        }
        Ok(pairs)
    }

    fn record_processed_mini_blocks(&self, pairs: Vec<(Hash, Hash)>) {
        let mut processed_mb = self.processed_mini_blocks.lock();
        for (meta_hash, mb_hash) in pairs {
            processed_mb.add_mini_block_hash(meta_hash, mb_hash);
        }
    }

    /// Headers of this shard notarized by the processed metachain headers,
    /// sorted by nonce.
    fn highest_headers_for_own_shard_from_metachain(
        &self,
        processed: &[(Hash, MetaHeader)],
    ) -> ProcessResult<Vec<TrackedHeader>> {
        let mut own = Vec::new();
        for (_, meta) in processed {
            own.extend(self.headers_for_shard_from_metachain(self.config.self_shard_id, meta)?);
        }
        own.sort_by_key(TrackedHeader::nonce);
        Ok(own)
    }

    fn headers_for_shard_from_metachain(&self, shard: ShardId, meta: &MetaHeader) -> ProcessResult<Vec<TrackedHeader>> {
        let mut found = Vec::new();
        let mut missing = None;
        for shard_data in meta.shard_info.iter().filter(|sd| sd.shard_id == shard) {
            match self.get_shard_header(&shard_data.header_hash) {
                Ok(own) => found.push(TrackedHeader::new(Header::Shard(own), shard_data.header_hash)),
                Err(e) => {
                    self.request_handler
                        .request_shard_header(shard_data.shard_id, shard_data.header_hash);
                    debug!(
                        hash = %short_hex(&shard_data.header_hash),
                        shard = shard_data.shard_id,
                        "requested missing shard header"
                    );
                    missing = Some(e);
                }
            }
        }
        match missing {
            Some(e) => Err(e),
            None => Ok(found),
        }
    }

    /// Moves the cross-notarized anchor of `shard` to the highest processed
    /// header if it is newer.
    fn save_last_notarized_header(&self, shard: ShardId, processed: &[(Hash, MetaHeader)]) {
        let Some((hash, meta)) = processed.last() else {
            return;
        };
        let newer = self
            .block_tracker
            .get_last_cross_notarized(shard)
            .map_or(true, |last| last.nonce() < meta.nonce);
        if newer {
            debug!(shard, nonce = meta.nonce, hash = %short_hex(hash), "last notarized header");
            self.block_tracker
                .add_cross_notarized_header(shard, Header::Meta(meta.clone()), *hash);
        }
    }

    /// Persists and evicts the processed metachain headers that are now
    /// cross-notarized.
    fn remove_processed_meta_blocks_from_pool(&self, processed: &[(Hash, MetaHeader)]) -> ProcessResult<()> {
        let anchor = self.block_tracker.get_last_cross_notarized(METACHAIN_SHARD_ID)?;

        let mut removed = 0usize;
        for (hash, meta) in processed {
            if meta.nonce > anchor.nonce() {
                continue;
            }
            log_not_critical("save_meta_header", self.save_meta_header(meta, hash));
            self.data_pool.headers.remove(hash);
            self.processed_mini_blocks.lock().remove_meta_block_hash(hash);
            trace!(
                round = meta.round,
                nonce = meta.nonce,
                hash = %short_hex(hash),
                "meta block has been processed completely and removed from pool"
            );
            removed += 1;
        }

        if removed > 0 {
            trace!(num_meta_blocks = removed, "meta blocks completely processed and removed from pool");
        }
        Ok(())
    }

    /// Highest final header of this shard, as the fork detector reports it.
    fn last_self_notarized_header_by_metachain(&self) -> Option<(Header, Hash)> {
        if self.fork_detector.highest_final_block_nonce() == 0 {
            return Some((self.chain.genesis_header().clone(), self.chain.genesis_hash()));
        }

        let hash = self.fork_detector.highest_final_block_hash();
        match self.get_shard_header(&hash) {
            Ok(header) => Some((Header::Shard(header), hash)),
            Err(e) => {
                warn!(hash = %short_hex(&hash), error = %e, "last self notarized header by metachain");
                None
            }
        }
    }

    fn update_state(&self, self_notarized: &[TrackedHeader], current: &ShardHeader) {
        self.snapshot_epoch_start_from_meta(current);

        for tracked in self_notarized {
            let prev_hash = *tracked.header.prev_hash();
            let prev_root = if prev_hash == self.chain.genesis_hash() {
                *self.chain.genesis_header().root_hash()
            } else {
                match self.get_shard_header_from_storage(&prev_hash) {
                    Ok(prev) => prev.root_hash,
                    Err(e) => {
                        debug!(hash = %short_hex(&prev_hash), error = %e, "could not get shard header from storage");
                        return;
                    }
                }
            };
            self.update_state_storage(&tracked.header, tracked.header.root_hash(), &prev_root);
        }
    }
}
