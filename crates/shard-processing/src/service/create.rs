//! Block creation: cross-shard miniblocks confirmed by the metachain first,
//! then miniblocks originating in this shard.

use super::ShardBlockProcessor;
use crate::domain::{create_mini_block_headers, delete_self_receipts_mini_blocks, Deadline, TrackedHeader};
use crate::error::{ProcessError, ProcessResult};
use crate::metrics;
use shared_types::{short_hex, Body, HeaderHandler, MiniBlock, ShardHeader, METACHAIN_SHARD_ID};
use tracing::{debug, info};

/// Cross-shard part of a new block.
#[derive(Debug, Default)]
struct CrossMiniBlocks {
    mini_blocks: Vec<MiniBlock>,
    txs_added: u32,
    headers_added: u32,
}

impl ShardBlockProcessor {
    pub(crate) async fn create_block_inner(
        &self,
        mut header: ShardHeader,
        deadline: Deadline,
    ) -> ProcessResult<(ShardHeader, Body)> {
        if header.shard_id != self.config.self_shard_id {
            return Err(ProcessError::ShardIdMismatch {
                expected: self.config.self_shard_id,
                actual: header.shard_id,
            });
        }

        self.create_block_started();

        if self.epoch_start_trigger.is_epoch_start() {
            let hash = self.epoch_start_trigger.epoch_start_meta_hdr_hash();
            debug!(epoch_start_meta_hash = %short_hex(&hash), "creating epoch start block");
            header.epoch_start_meta_hash = Some(hash);
        }
        header.epoch = self.epoch_start_trigger.epoch();

        debug!(epoch = header.epoch, round = header.round, nonce = header.nonce, "started creating block body");
        let body = self.create_mini_blocks(deadline)?;
        self.request_handler.set_epoch(header.epoch);

        let body = self.apply_body_to_header(&mut header, body);
        self.check_and_request_if_meta_headers_missing(header.round);
        let body = body?;

        info!(
            nonce = header.nonce,
            round = header.round,
            num_mini_blocks = body.mini_blocks.len(),
            num_txs = header.tx_count,
            num_meta_headers = header.meta_block_hashes.len(),
            "block created"
        );
        metrics::record_created();
        Ok((header, body))
    }

    fn create_mini_blocks(&self, deadline: Deadline) -> ProcessResult<Body> {
        if self.accounts.journal_len() != 0 {
            return Err(ProcessError::AccountStateDirty);
        }
        if !deadline.has_time() {
            debug!("time is up after entered in create_mini_blocks");
            return Err(ProcessError::TimeIsOut);
        }

        let mut mini_blocks = Vec::new();
        match self.create_and_process_cross_mini_blocks_dst_me(deadline) {
            Ok(cross) => {
                if !cross.mini_blocks.is_empty() {
                    debug!(
                        num_mini_blocks = cross.mini_blocks.len(),
                        num_txs = cross.txs_added,
                        num_meta_headers = cross.headers_added,
                        "processed miniblocks and txs with destination in self shard"
                    );
                }
                mini_blocks.extend(cross.mini_blocks);
            }
            Err(e) => debug!(error = %e, "create and process cross miniblocks dst me"),
        }

        let from_me = self.tx_coordinator.create_mbs_and_process_transactions_from_me(deadline);
        if !from_me.is_empty() {
            let num_txs: usize = from_me.iter().map(|mb| mb.tx_hashes.len()).sum();
            debug!(num_mini_blocks = from_me.len(), num_txs, "processed miniblocks and txs from self shard");
        }
        mini_blocks.extend(from_me);

        debug!(num_mini_blocks = mini_blocks.len(), "creating miniblocks has been finished");
        Ok(Body::new(mini_blocks))
    }

    /// Walks the longest metachain chain above the last cross-notarized
    /// header and executes what each header sends to this shard.
    fn create_and_process_cross_mini_blocks_dst_me(&self, deadline: Deadline) -> ProcessResult<CrossMiniBlocks> {
        let ordered = self
            .block_tracker
            .compute_longest_chain_from_last_notarized(METACHAIN_SHARD_ID)?;
        debug!(num_meta_blocks = ordered.len(), "meta blocks ordered");

        let mut last = self
            .block_tracker
            .get_last_cross_notarized(METACHAIN_SHARD_ID)?
            .header;
        let self_shard = self.config.self_shard_id;
        let max_headers = self.config.max_meta_headers_in_one_shard_block;

        let mut cross = CrossMiniBlocks::default();
        let mut used: Vec<TrackedHeader> = Vec::new();
        for tracked in ordered {
            if !deadline.has_time() {
                debug!(num_txs = cross.txs_added, "time is up after putting cross txs with destination to current shard");
                break;
            }
            if cross.headers_added >= max_headers {
                debug!(headers_added = cross.headers_added, "maximum meta headers in one shard block reached");
                break;
            }
            if tracked.nonce() > last.nonce() + 1 {
                debug!(last = last.nonce(), current = tracked.nonce(), "skip searching");
                break;
            }

            let Some(meta) = tracked.header.as_meta() else {
                break;
            };
            if meta.mini_block_headers_with_dst(self_shard).is_empty() {
                cross.headers_added += 1;
                last = tracked.header.clone();
                used.push(tracked);
                continue;
            }

            let processed = self
                .processed_mini_blocks
                .lock()
                .processed_mini_blocks_hashes(&tracked.hash);
            let outcome = match self
                .tx_coordinator
                .create_mbs_and_process_cross_shard_transactions_dst_me(meta, &processed, deadline)
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!(nonce = tracked.nonce(), error = %e, "cross shard transactions dst me");
                    break;
                }
            };

            cross.mini_blocks.extend(outcome.mini_blocks);
            cross.txs_added += outcome.txs_added;
            let finished = outcome.finished;
            let next_last = tracked.header.clone();
            if outcome.txs_added > 0 {
                cross.headers_added += 1;
                used.push(tracked.clone());
            }

            if !finished {
                debug!(
                    round = tracked.header.round(),
                    nonce = tracked.nonce(),
                    hash = %short_hex(&tracked.hash),
                    "meta block cannot be fully processed"
                );
                break;
            }
            last = next_last;
        }

        self.in_flight.with(|state| {
            for tracked in used {
                state.register_reference(tracked.hash, Some(tracked.header), true);
            }
        });

        self.request_meta_headers_if_needed(cross.headers_added, last.nonce());
        Ok(cross)
    }

    fn request_meta_headers_if_needed(&self, headers_added: u32, last_nonce: u64) {
        debug!(headers_added, last_meta_nonce = last_nonce, "meta headers added");
        if headers_added > 0 {
            return;
        }
        let from = last_nonce + 1;
        let to = from + u64::from(self.config.meta_block_finality);
        let nonces: Vec<u64> = (from..=to).collect();
        self.request_headers_by_nonce(METACHAIN_SHARD_ID, &nonces);
    }

    /// Fills the body-derived fields of `header` and returns the body as it
    /// will be broadcast.
    fn apply_body_to_header(&self, header: &mut ShardHeader, mut body: Body) -> ProcessResult<Body> {
        header.mini_block_headers.clear();
        header.root_hash = self.root_hash();
        header.receipts_hash = self.tx_coordinator.create_receipts_hash()?;

        delete_self_receipts_mini_blocks(&mut body);
        let (tx_count, mini_block_headers) = create_mini_block_headers(&body)?;
        header.mini_block_headers = mini_block_headers;
        header.tx_count = tx_count;
        header.accumulated_fees = self.tx_coordinator.accumulated_fees();
        header.meta_block_hashes = self
            .in_flight
            .with(|state| state.sorted_hashes_for_shard(METACHAIN_SHARD_ID, true));

        Ok(body)
    }
}
