//! # Shard Block Processor Service
//!
//! The state machine behind [`BlockProcessor`](crate::ports::BlockProcessor):
//! process an incoming block, create a new one, commit, roll back.
//!
//! ## Layout
//!
//! - `api.rs` - `BlockProcessor` implementation (entry points, metrics, revert)
//! - `base.rs` - validity, state root, gap requests, pool cleanup, state
//!   storage, bootstrap persistence
//! - `meta_headers.rs` - referenced metachain headers: arrival pipeline,
//!   missing/finality requests, K-finality, cross-shard confirmation
//! - `process.rs` - `ProcessBlock` and the epoch rules
//! - `create.rs` - `CreateBlock`
//! - `commit.rs` - `CommitBlock` and notarization bookkeeping
//! - `restore.rs` - rollback into pools and bootstrap restore
//!
//! ## Locking
//!
//! The in-flight header set is taken before the block tracker, never the
//! other way round. Requests decided under a lock are issued after it is
//! released.

mod api;
mod base;
mod commit;
mod create;
mod meta_headers;
mod process;
mod restore;

use crate::adapters::{BlockChain, DataPool};
use crate::config::ProcessorConfig;
use crate::domain::{BlockTracker, InFlightHeaderSet, ProcessedMiniBlockTracker};
use crate::error::{ProcessError, ProcessResult};
use crate::ports::{
    AccountsAdapter, BootstrapStorer, EpochStartTrigger, ForkDetector, NodesCoordinator,
    RequestHandler, StorageService, TransactionCoordinator,
};
use parking_lot::Mutex;
use shared_types::{Hash, HeaderHandler, MetaHeader, METACHAIN_SHARD_ID};
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Collaborators of a [`ShardBlockProcessor`].
pub struct ShardProcessorDependencies {
    pub accounts: Arc<dyn AccountsAdapter>,
    pub tx_coordinator: Arc<dyn TransactionCoordinator>,
    pub request_handler: Arc<dyn RequestHandler>,
    pub epoch_start_trigger: Arc<dyn EpochStartTrigger>,
    pub fork_detector: Arc<dyn ForkDetector>,
    pub nodes_coordinator: Arc<dyn NodesCoordinator>,
    pub storage: Arc<dyn StorageService>,
    pub bootstrap_storer: Arc<dyn BootstrapStorer>,
    pub data_pool: Arc<DataPool>,
    pub chain: Arc<BlockChain>,
    pub block_tracker: Arc<BlockTracker>,
}

/// Block processor of one shard.
///
/// One instance per shard. Block attempts on it are serialized by the
/// caller; header arrivals may run concurrently with an attempt.
pub struct ShardBlockProcessor {
    pub(crate) accounts: Arc<dyn AccountsAdapter>,
    pub(crate) tx_coordinator: Arc<dyn TransactionCoordinator>,
    pub(crate) request_handler: Arc<dyn RequestHandler>,
    pub(crate) epoch_start_trigger: Arc<dyn EpochStartTrigger>,
    pub(crate) fork_detector: Arc<dyn ForkDetector>,
    pub(crate) nodes_coordinator: Arc<dyn NodesCoordinator>,
    pub(crate) storage: Arc<dyn StorageService>,
    pub(crate) bootstrap_storer: Arc<dyn BootstrapStorer>,
    pub(crate) data_pool: Arc<DataPool>,
    pub(crate) chain: Arc<BlockChain>,
    pub(crate) block_tracker: Arc<BlockTracker>,
    pub(crate) config: ProcessorConfig,
    /// Metachain headers referenced by the block in progress.
    pub(crate) in_flight: InFlightHeaderSet,
    pub(crate) processed_mini_blocks: Mutex<ProcessedMiniBlockTracker>,
    /// Arrived metachain headers not handled yet.
    pub(crate) received_headers: Mutex<VecDeque<(MetaHeader, Hash)>>,
    /// Bumped whenever an arrival puts the epoch-start trigger in epoch start.
    pub(crate) epoch_start_signal: watch::Sender<u64>,
    pub(crate) lowest_nonce_in_self_notarized: AtomicU64,
    /// Last bootstrap write; the next one waits for it.
    pub(crate) bootstrap_task: Mutex<Option<JoinHandle<()>>>,
}

impl ShardBlockProcessor {
    /// Builds a processor over `deps`.
    ///
    /// The chain's genesis must belong to `config.self_shard_id`, and the
    /// tracker must already know the metachain.
    pub fn new(deps: ShardProcessorDependencies, config: ProcessorConfig) -> ProcessResult<Self> {
        config.validate()?;

        let genesis_shard = deps.chain.genesis_header().shard_id();
        if genesis_shard != config.self_shard_id {
            return Err(ProcessError::ShardIdMismatch {
                expected: config.self_shard_id,
                actual: genesis_shard,
            });
        }
        deps.block_tracker.get_last_cross_notarized(METACHAIN_SHARD_ID)?;

        deps.request_handler
            .set_epoch(deps.epoch_start_trigger.epoch());

        let (epoch_start_signal, _) = watch::channel(0);
        Ok(Self {
            accounts: deps.accounts,
            tx_coordinator: deps.tx_coordinator,
            request_handler: deps.request_handler,
            epoch_start_trigger: deps.epoch_start_trigger,
            fork_detector: deps.fork_detector,
            nodes_coordinator: deps.nodes_coordinator,
            storage: deps.storage,
            bootstrap_storer: deps.bootstrap_storer,
            data_pool: deps.data_pool,
            chain: deps.chain,
            block_tracker: deps.block_tracker,
            config,
            in_flight: InFlightHeaderSet::new(),
            processed_mini_blocks: Mutex::new(ProcessedMiniBlockTracker::new()),
            received_headers: Mutex::new(VecDeque::new()),
            epoch_start_signal,
            lowest_nonce_in_self_notarized: AtomicU64::new(0),
            bootstrap_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn block_tracker(&self) -> &Arc<BlockTracker> {
        &self.block_tracker
    }

    /// Copy of the processed miniblock tracker.
    pub fn processed_mini_blocks(&self) -> ProcessedMiniBlockTracker {
        self.processed_mini_blocks.lock().clone()
    }

    /// Waits for the last scheduled bootstrap write to finish.
    pub async fn flush_bootstrap(&self) {
        let task = self.bootstrap_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
