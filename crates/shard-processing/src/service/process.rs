//! Processing of a proposed block and the epoch rules it must satisfy.

use super::ShardBlockProcessor;
use crate::domain::{check_header_body_correlation, Deadline};
use crate::error::{ProcessError, ProcessResult};
use crate::ports::epoch_start_identifier;
use shared_types::{calculate_hash, short_hex, Body, Header, HeaderHandler, ShardHeader};
use tracing::{debug, info, warn};

impl ShardBlockProcessor {
    pub(crate) async fn process_block_inner(
        &self,
        header: &Header,
        body: &Body,
        deadline: Deadline,
    ) -> ProcessResult<()> {
        let shard_header = self.own_shard_header(header)?;

        if let Err(e) = self.check_block_validity(header) {
            if matches!(e, ProcessError::BlockHashDoesNotMatch) {
                self.request_handler
                    .request_shard_header(shard_header.shard_id, shard_header.prev_hash);
            }
            return Err(e);
        }

        self.request_handler.set_epoch(shard_header.epoch);
        info!(
            shard = shard_header.shard_id,
            epoch = shard_header.epoch,
            round = shard_header.round,
            nonce = shard_header.nonce,
            "started processing block"
        );

        check_header_body_correlation(&shard_header.mini_block_headers, body)?;

        self.create_block_started();
        self.tx_coordinator.request_block_transactions(body);
        let requested = self.request_meta_headers(shard_header);

        if !deadline.has_time() {
            return Err(ProcessError::TimeIsOut);
        }

        self.tx_coordinator
            .is_data_prepared_for_processing(deadline)
            .await?;

        if !requested.is_complete() {
            debug!(
                num_headers = requested.headers,
                num_finality_attesting = requested.finality_attesting,
                "requested missing meta headers"
            );
            let waited = self.in_flight.wait_until_complete(deadline).await;
            let still_missing = self.in_flight.with(|state| {
                let missing = state.missing_count();
                state.reset_missing();
                missing
            });
            if requested.headers > 0 {
                debug!(
                    num_headers = requested.headers.saturating_sub(still_missing),
                    "received missing meta headers"
                );
            }
            waited?;
        }

        self.request_epoch_start_info(shard_header, deadline).await?;

        if self.accounts.journal_len() != 0 {
            return Err(ProcessError::AccountStateDirty);
        }

        let result = self.verify_and_execute(shard_header, body, deadline);
        self.check_and_request_if_meta_headers_missing(shard_header.round);
        result
    }

    fn verify_and_execute(&self, header: &ShardHeader, body: &Body, deadline: Deadline) -> ProcessResult<()> {
        self.check_epoch_correctness(header)?;
        self.check_meta_headers_validity_and_finality()?;
        self.verify_cross_shard_mini_block_dst_me(header)?;
        if header.is_start_of_epoch() {
            self.check_epoch_correctness_cross_chain()?;
        }

        self.tx_coordinator.process_block_transactions(body, deadline)?;
        self.tx_coordinator.verify_created_block_transactions(body)?;

        let computed = self.tx_coordinator.accumulated_fees();
        if computed != header.accumulated_fees {
            return Err(ProcessError::AccumulatedFeesDoNotMatch {
                header: header.accumulated_fees,
                computed,
            });
        }

        if !self.verify_state_root(&header.root_hash) {
            return Err(ProcessError::RootStateDoesNotMatch);
        }
        Ok(())
    }

    /// Clears the per-block state of this processor and its coordinator.
    pub(crate) fn create_block_started(&self) {
        self.in_flight.reset();
        self.tx_coordinator.create_block_started();
    }

    /// A block opening an epoch the trigger has not reached yet waits for
    /// the epoch-start metachain header to arrive.
    async fn request_epoch_start_info(&self, header: &ShardHeader, deadline: Deadline) -> ProcessResult<()> {
        if !header.is_start_of_epoch() {
            return Ok(());
        }

        let mut signal = self.epoch_start_signal.subscribe();
        signal.borrow_and_update();
        if self.epoch_start_trigger.is_epoch_start() {
            return Ok(());
        }

        if let Some(hash) = header.epoch_start_meta_hash {
            self.request_handler.request_meta_header(hash);
        }
        loop {
            match tokio::time::timeout_at(deadline.instant(), signal.changed()).await {
                Ok(Ok(())) if self.epoch_start_trigger.is_epoch_start() => return Ok(()),
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Err(ProcessError::TimeIsOut),
            }
        }
    }

    /// Epoch transition rules, evaluated in a fixed order; the first one
    /// that fails decides the error.
    pub(crate) fn check_epoch_correctness(&self, header: &ShardHeader) -> ProcessResult<()> {
        let Some(current) = self.chain.current_header() else {
            return Ok(());
        };
        let trigger = &self.epoch_start_trigger;
        let trigger_epoch = trigger.epoch();

        if header.epoch < current.epoch() {
            return Err(ProcessError::epoch_mismatch(format!(
                "proposed header with older epoch {} than blockchain epoch {}",
                header.epoch,
                current.epoch()
            )));
        }

        if header.epoch == current.epoch() && header.is_start_of_epoch() {
            return Err(ProcessError::epoch_mismatch(format!(
                "proposed header with same epoch {} as blockchain and it is of epoch start",
                current.epoch()
            )));
        }

        if header.epoch != current.epoch() && trigger_epoch == current.epoch() {
            return Err(ProcessError::epoch_mismatch(format!(
                "proposed header with new epoch {} with trigger still in last epoch {}",
                header.epoch, trigger_epoch
            )));
        }

        if header.epoch > trigger_epoch {
            return Err(ProcessError::epoch_mismatch(format!(
                "proposed header with epoch too high {} with trigger in epoch {}",
                header.epoch, trigger_epoch
            )));
        }

        let finality_round = trigger.epoch_finality_attesting_round();
        let is_old_epoch_and_should_be_new = trigger.is_epoch_start()
            && header.round > finality_round + self.config.epoch_change_grace_period
            && header.epoch < trigger_epoch
            && trigger.epoch_start_round() < finality_round;
        if is_old_epoch_and_should_be_new {
            return Err(ProcessError::epoch_mismatch(format!(
                "proposed header with epoch {} should be in epoch {}",
                header.epoch, trigger_epoch
            )));
        }

        let trigger_meta_hash = trigger.epoch_start_meta_hdr_hash();
        if let Some(proposed) = header.epoch_start_meta_hash {
            if proposed != trigger_meta_hash && header.epoch == trigger_epoch {
                self.request_handler.request_meta_header(proposed);
                warn!(
                    proposed = %short_hex(&proposed),
                    calculated = %short_hex(&trigger_meta_hash),
                    "epoch start meta hash mismatch"
                );
                return Err(ProcessError::epoch_mismatch(format!(
                    "proposed header with epoch {} has invalid epoch start meta hash",
                    header.epoch
                )));
            }
        }

        if header.epoch != current.epoch() && !header.is_start_of_epoch() {
            return Err(ProcessError::epoch_mismatch(format!(
                "proposed header with new epoch {} is not of type epoch start",
                header.epoch
            )));
        }

        if let Some(proposed) = header.epoch_start_meta_hash {
            if header.epoch < trigger_epoch {
                let key = epoch_start_identifier(header.epoch);
                let meta = self.get_meta_header_from_storage(key.as_bytes())?;
                let meta_hash = calculate_hash(&meta)?;
                if proposed != meta_hash {
                    warn!(
                        proposed = %short_hex(&proposed),
                        calculated = %short_hex(&meta_hash),
                        "epoch start meta hash mismatch"
                    );
                    return Err(ProcessError::epoch_mismatch(format!(
                        "proposed header with epoch {} has invalid epoch start meta hash",
                        header.epoch
                    )));
                }
            }
        }

        Ok(())
    }

    /// Blocks still in the previous epoch past the grace period mean the
    /// local chain is wrongly built: the fork detector gets a rollback nonce.
    pub(crate) fn check_epoch_correctness_cross_chain(&self) -> ProcessResult<()> {
        let Some(mut current) = self.chain.current_header() else {
            return Ok(());
        };

        let trigger_epoch = self.epoch_start_trigger.epoch();
        let new_epoch_round =
            self.epoch_start_trigger.epoch_finality_attesting_round() + self.config.epoch_change_grace_period;

        let mut rollback_nonce = None;
        while current.round() > new_epoch_round && current.epoch() < trigger_epoch {
            let prev_hash = *current.prev_hash();
            let prev = if prev_hash == self.chain.genesis_hash() {
                self.chain.genesis_header().clone()
            } else {
                Header::Shard(self.get_shard_header_from_storage(&prev_hash)?)
            };
            rollback_nonce = Some(current.nonce());
            current = prev;
        }

        match rollback_nonce {
            Some(nonce) => {
                debug!(reverted_to_nonce = nonce, "blockchain is wrongly constructed");
                self.fork_detector.set_rollback_nonce(nonce);
                Err(ProcessError::epoch_mismatch(format!(
                    "local chain still in epoch {} past the epoch change, rollback to nonce {nonce}",
                    current.epoch()
                )))
            }
            None => Ok(()),
        }
    }
}
