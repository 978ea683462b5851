//! Metachain headers referenced by the block in progress: arrival pipeline,
//! missing and finality requests, K-finality and cross-shard confirmation.

use super::ShardBlockProcessor;
use crate::domain::{check_construction, MissingCounts};
use crate::error::{ProcessError, ProcessResult};
use crate::service::base::log_not_critical;
use shared_types::{short_hex, Hash, Header, HeaderHandler, MetaHeader, ShardHeader, METACHAIN_SHARD_ID};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

impl ShardBlockProcessor {
    /// Queues an arrived metachain header and drains the queue.
    ///
    /// No lock is held while a queued header is handled.
    pub(crate) fn enqueue_received_meta_header(&self, header: MetaHeader, hash: Hash) {
        self.received_headers.lock().push_back((header, hash));
        loop {
            let next = self.received_headers.lock().pop_front();
            let Some((header, hash)) = next else {
                break;
            };
            self.handle_received_meta_header(header, hash);
        }
    }

    fn handle_received_meta_header(&self, meta: MetaHeader, hash: Hash) {
        trace!(nonce = meta.nonce, round = meta.round, hash = %short_hex(&hash), "received meta block");
        self.request_handler
            .header_received(METACHAIN_SHARD_ID, meta.nonce, hash);

        let header = Header::Meta(meta.clone());
        self.data_pool.headers.add(hash, header.clone());

        let anchor = match self.block_tracker.get_last_cross_notarized(METACHAIN_SHARD_ID) {
            Ok(anchor) => anchor,
            Err(e) => {
                warn!(error = %e, "no metachain anchor, received header dropped");
                return;
            }
        };
        let out_of_range = meta.nonce > anchor.nonce() + self.config.allowed_headers_ahead();
        if !out_of_range {
            self.block_tracker.add_tracked_header(header.clone(), hash);
        }

        let finality_nonces = self.in_flight.with(|state| {
            if state.counts().is_complete() {
                return Vec::new();
            }
            state.mark_received(&hash, &header);
            if state.missing_count() > 0 {
                return Vec::new();
            }
            let missing = self.missing_finality_attesting_headers(state, METACHAIN_SHARD_ID);
            if missing.is_empty() {
                debug!("received all missing finality attesting meta headers");
            }
            missing
        });
        self.request_headers_by_nonce(METACHAIN_SHARD_ID, &finality_nonces);

        if out_of_range {
            self.data_pool.headers.remove(&hash);
            return;
        }

        if meta.nonce <= anchor.nonce() || meta.round <= anchor.header.round() {
            return;
        }

        self.epoch_start_trigger.received_header(&meta);
        if self.epoch_start_trigger.is_epoch_start() {
            self.epoch_start_signal.send_modify(|generation| *generation += 1);
        }

        if meta.nonce > anchor.nonce() + self.config.max_headers_to_request_in_advance {
            return;
        }
        self.request_handler.request_mini_blocks(&meta);
    }

    /// Registers every metachain header `header` references and requests
    /// what is neither in the pool nor tracked.
    pub(crate) fn request_meta_headers(&self, header: &ShardHeader) -> MissingCounts {
        if header.meta_block_hashes.is_empty() {
            return MissingCounts::default();
        }

        let (missing_hashes, finality_nonces, counts) = self.in_flight.with(|state| {
            let mut missing = Vec::new();
            for hash in &header.meta_block_hashes {
                match self.data_pool.headers.get(hash) {
                    Some(meta @ Header::Meta(_)) => state.register_reference(*hash, Some(meta), true),
                    _ => {
                        state.register_reference(*hash, None, true);
                        missing.push(*hash);
                    }
                }
            }
            let finality = if state.missing_count() == 0 {
                self.missing_finality_attesting_headers(state, METACHAIN_SHARD_ID)
            } else {
                Vec::new()
            };
            (missing, finality, state.counts())
        });

        for hash in missing_hashes {
            self.request_handler.request_meta_header(hash);
        }
        self.request_headers_by_nonce(METACHAIN_SHARD_ID, &finality_nonces);
        counts
    }

    /// Referenced metachain headers must chain from the last cross-notarized
    /// one, and the last of them must be final.
    pub(crate) fn check_meta_headers_validity_and_finality(&self) -> ProcessResult<()> {
        let mut last = self
            .block_tracker
            .get_last_cross_notarized(METACHAIN_SHARD_ID)?
            .header;

        let used = self.in_flight.with(|state| {
            state
                .sorted_by_nonce(true)
                .remove(&METACHAIN_SHARD_ID)
                .unwrap_or_default()
        });
        if used.is_empty() {
            return Ok(());
        }

        for (hash, meta) in used {
            if let Err(e) = check_construction(&meta, Some(&last)) {
                debug!(nonce = meta.nonce(), hash = %short_hex(&hash), error = %e, "meta header construction");
                return Err(e);
            }
            last = meta;
        }

        self.check_meta_header_finality(&last)
    }

    /// Needs `meta_block_finality` chained successors of `header` among the
    /// finality attesting headers. When short, the two nonces after the last
    /// verified one are requested.
    pub(crate) fn check_meta_header_finality(&self, header: &Header) -> ProcessResult<()> {
        let attesting = self.in_flight.with(|state| {
            state
                .sorted_by_nonce(false)
                .remove(&METACHAIN_SHARD_ID)
                .unwrap_or_default()
        });

        let finality = self.config.meta_block_finality;
        let mut last_verified = header.clone();
        let mut verified = 0u32;
        for (hash, meta) in attesting {
            if verified >= finality {
                break;
            }
            if meta.nonce() != last_verified.nonce() + 1 {
                continue;
            }
            if let Err(e) = check_construction(&meta, Some(&last_verified)) {
                debug!(nonce = meta.nonce(), hash = %short_hex(&hash), error = %e, "finality attesting header");
                continue;
            }
            last_verified = meta;
            verified += 1;
        }

        if verified < finality {
            let next = last_verified.nonce() + 1;
            self.request_headers_by_nonce(METACHAIN_SHARD_ID, &[next, next + 1]);
            debug!(nonce = header.nonce(), verified, finality, "meta header is not final");
            return Err(ProcessError::HeaderNotFinal);
        }
        Ok(())
    }

    /// Every cross-shard miniblock `header` receives must be confirmed by one
    /// of its referenced metachain headers.
    pub(crate) fn verify_cross_shard_mini_block_dst_me(&self, header: &ShardHeader) -> ProcessResult<()> {
        let confirmed = self.all_mini_blocks_dst_me_from_meta(header)?;
        for mb_hash in header.mini_block_headers_with_dst(self.config.self_shard_id).keys() {
            if !confirmed.contains_key(mb_hash) {
                debug!(mini_block = %short_hex(mb_hash), "cross shard miniblock without meta confirmation");
                return Err(ProcessError::CrossShardMbWithoutConfirmationFromMeta);
            }
        }
        Ok(())
    }

    /// Miniblock hash to confirming metachain header hash, over the
    /// referenced headers newer than the last cross-notarized one and not
    /// newer than `header`.
    fn all_mini_blocks_dst_me_from_meta(&self, header: &ShardHeader) -> ProcessResult<HashMap<Hash, Hash>> {
        let last = self.block_tracker.get_last_cross_notarized(METACHAIN_SHARD_ID)?;
        let self_shard = self.config.self_shard_id;

        self.in_flight.with(|state| -> ProcessResult<HashMap<Hash, Hash>> {
            let mut confirmed = HashMap::new();
            for meta_hash in &header.meta_block_hashes {
                let Some(info) = state.get(meta_hash) else {
                    continue;
                };
                let Some(found) = &info.header else {
                    continue;
                };
                let meta = found.as_meta().ok_or(ProcessError::WrongTypeAssertion {
                    expected: "meta header",
                })?;
                if meta.round > header.round
                    || meta.round <= last.header.round()
                    || meta.nonce <= last.nonce()
                {
                    continue;
                }
                for mb_hash in meta.mini_block_headers_with_dst(self_shard).into_keys() {
                    confirmed.insert(mb_hash, *meta_hash);
                }
            }
            Ok(confirmed)
        })
    }

    /// Requests gaps between the tracked metachain headers not newer than
    /// `round`.
    pub(crate) fn check_and_request_if_meta_headers_missing(&self, round: u64) {
        let tracked = self.block_tracker.tracked_headers(METACHAIN_SHARD_ID);
        log_not_critical(
            "request_missing_meta_headers",
            self.request_headers_if_missing(&tracked, METACHAIN_SHARD_ID, round),
        );
    }
}
