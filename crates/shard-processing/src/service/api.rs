//! `BlockProcessor` entry points: metrics, rejection accounting and the
//! accounts revert every failed attempt ends with.

use super::ShardBlockProcessor;
use crate::domain::{bodies_by_destination, BootstrapData, Deadline};
use crate::error::ProcessResult;
use crate::metrics;
use crate::ports::{BlockProcessor, BroadcastData};
use async_trait::async_trait;
use shared_types::{marshal, Body, Hash, Header, HeaderHandler, MetaHeader, ShardHeader};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

#[async_trait]
impl BlockProcessor for ShardBlockProcessor {
    #[instrument(skip_all, fields(nonce = header.nonce(), round = header.round()))]
    async fn process_block(&self, header: &Header, body: &Body, deadline: Deadline) -> ProcessResult<()> {
        let _timer = metrics::processing_timer();
        match self.process_block_inner(header, body, deadline).await {
            Ok(()) => {
                metrics::record_processed();
                Ok(())
            }
            Err(e) => {
                self.revert_accounts();
                metrics::record_rejection(&e);
                debug!(error = %e, kind = e.kind().as_str(), "block processing failed");
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(nonce = initial.nonce, round = initial.round))]
    async fn create_block(&self, initial: ShardHeader, deadline: Deadline) -> ProcessResult<(ShardHeader, Body)> {
        let created = self.create_block_inner(initial, deadline).await;
        if let Err(e) = &created {
            self.revert_accounts();
            debug!(error = %e, "block creation failed");
        }
        created
    }

    #[instrument(skip_all, fields(nonce = header.nonce(), round = header.round()))]
    async fn commit_block(&self, header: &Header, body: &Body) -> ProcessResult<()> {
        let committed = self.commit_block_inner(header, body).await;
        if let Err(e) = &committed {
            self.revert_accounts();
            metrics::record_rejection(e);
            warn!(error = %e, "block commit failed");
        }
        committed
    }

    fn revert_account_state(&self) {
        self.revert_accounts();
    }

    fn revert_state_to_block(&self, header: &Header) -> ProcessResult<()> {
        self.revert_state_to_block_inner(header)
    }

    fn prune_state_on_rollback(&self, current: &Header, previous: &Header) {
        self.prune_state_on_rollback_inner(current, previous);
    }

    fn restore_block_into_pools(&self, header: &Header, body: &Body) -> ProcessResult<()> {
        self.restore_block_into_pools_inner(header, body)
    }

    fn marshalized_data_to_broadcast(&self, body: &Body) -> ProcessResult<BroadcastData> {
        let mut bodies = BTreeMap::new();
        for (shard, shard_body) in bodies_by_destination(body, self.config.self_shard_id) {
            match marshal(&shard_body) {
                Ok(bytes) => {
                    bodies.insert(shard, bytes);
                }
                Err(e) => debug!(shard, error = %e, "marshal body for shard"),
            }
        }

        Ok(BroadcastData {
            bodies,
            transactions: self.tx_coordinator.create_marshalized_data(body),
        })
    }

    fn get_block_body_from_pool(&self, header: &Header) -> ProcessResult<Body> {
        self.block_body_from_pool(header)
    }

    fn restore_from_bootstrap(&self, data: &BootstrapData) -> ProcessResult<()> {
        self.restore_from_bootstrap_inner(data)
    }

    fn on_meta_header_received(&self, header: MetaHeader, hash: Hash) {
        self.enqueue_received_meta_header(header, hash);
    }
}
