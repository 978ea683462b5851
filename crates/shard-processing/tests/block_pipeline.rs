//! # Block Pipeline Tests
//!
//! A proposer creates blocks on top of a metachain that confirms one
//! cross-shard miniblock per header. A validator processes and commits
//! them, then a third node resumes from the validator's bootstrap data and
//! keeps validating.

use async_trait::async_trait;
use parking_lot::Mutex;
use shard_processing::ports::{
    AccountsAdapter, BootstrapStorer, CrossShardOutcome, EpochStartTrigger, ForkDetector,
    NodesCoordinator, PruneDirection, RequestHandler, TransactionCoordinator,
};
use shard_processing::{
    BlockChain, BlockProcessor, BlockTracker, DataPool, Deadline, MemoryStorage, ProcessResult,
    ProcessorConfig, ShardBlockProcessor, ShardProcessorDependencies, StorageBootstrapper,
    TrackedHeader,
};
use shared_types::{
    calculate_hash, Body, Hash, Header, MetaHeader, MiniBlock, MiniBlockHeader, MiniBlockType,
    ShardData, ShardHeader, ShardId, EMPTY_HASH, METACHAIN_SHARD_ID,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

const STATE_ROOT: Hash = [0x42; 32];

// =============================================================================
// TEST DOUBLES
// =============================================================================

struct FixedAccounts;

impl AccountsAdapter for FixedAccounts {
    fn root_hash(&self) -> ProcessResult<Hash> {
        Ok(STATE_ROOT)
    }
    fn commit(&self) -> ProcessResult<Hash> {
        Ok(STATE_ROOT)
    }
    fn journal_len(&self) -> usize {
        0
    }
    fn revert_to_snapshot(&self, _snapshot: usize) -> ProcessResult<()> {
        Ok(())
    }
    fn recreate_trie(&self, _root: &Hash) -> ProcessResult<()> {
        Ok(())
    }
    fn snapshot_state(&self, _root: &Hash) {}
    fn set_state_checkpoint(&self, _root: &Hash) {}
    fn prune_trie(&self, _root: &Hash, _direction: PruneDirection) {}
    fn cancel_prune(&self, _root: &Hash, _direction: PruneDirection) {}
    fn is_pruning_enabled(&self) -> bool {
        false
    }
}

/// Executes every cross-shard miniblock it was told about.
#[derive(Default)]
struct Coordinator {
    known: Mutex<HashMap<Hash, MiniBlock>>,
}

#[async_trait]
impl TransactionCoordinator for Coordinator {
    fn create_block_started(&self) {}
    fn request_block_transactions(&self, _body: &Body) {}
    async fn is_data_prepared_for_processing(&self, _deadline: Deadline) -> ProcessResult<()> {
        Ok(())
    }
    fn process_block_transactions(&self, _body: &Body, _deadline: Deadline) -> ProcessResult<()> {
        Ok(())
    }
    fn verify_created_block_transactions(&self, _body: &Body) -> ProcessResult<()> {
        Ok(())
    }
    fn accumulated_fees(&self) -> u128 {
        0
    }
    fn create_receipts_hash(&self) -> ProcessResult<Hash> {
        Ok(EMPTY_HASH)
    }
    fn create_mbs_and_process_cross_shard_transactions_dst_me(
        &self,
        meta_header: &MetaHeader,
        processed: &BTreeSet<Hash>,
        _deadline: Deadline,
    ) -> ProcessResult<CrossShardOutcome> {
        let known = self.known.lock();
        let mut outcome = CrossShardOutcome {
            finished: true,
            ..Default::default()
        };
        for hash in meta_header.mini_block_headers_with_dst(0).keys() {
            if processed.contains(hash) {
                continue;
            }
            if let Some(mb) = known.get(hash) {
                outcome.txs_added += mb.tx_hashes.len() as u32;
                outcome.mini_blocks.push(mb.clone());
            }
        }
        Ok(outcome)
    }
    fn create_mbs_and_process_transactions_from_me(&self, _deadline: Deadline) -> Vec<MiniBlock> {
        Vec::new()
    }
    fn remove_block_data_from_pool(&self, _body: &Body) -> ProcessResult<()> {
        Ok(())
    }
    fn restore_block_data_from_storage(&self, body: &Body) -> ProcessResult<usize> {
        Ok(body.tx_count())
    }
    fn create_marshalized_data(&self, _body: &Body) -> BTreeMap<String, Vec<Vec<u8>>> {
        BTreeMap::new()
    }
}

struct NoRequests;

impl RequestHandler for NoRequests {
    fn set_epoch(&self, _epoch: u32) {}
    fn request_shard_header(&self, _shard: ShardId, _hash: Hash) {}
    fn request_shard_header_by_nonce(&self, _shard: ShardId, _nonce: u64) {}
    fn request_meta_header(&self, _hash: Hash) {}
    fn request_meta_header_by_nonce(&self, _nonce: u64) {}
    fn request_mini_blocks(&self, _meta_header: &MetaHeader) {}
}

struct EpochZero;

impl EpochStartTrigger for EpochZero {
    fn epoch(&self) -> u32 {
        0
    }
    fn is_epoch_start(&self) -> bool {
        false
    }
    fn epoch_start_round(&self) -> u64 {
        0
    }
    fn epoch_finality_attesting_round(&self) -> u64 {
        0
    }
    fn epoch_start_meta_hdr_hash(&self) -> Hash {
        EMPTY_HASH
    }
    fn received_header(&self, _header: &MetaHeader) {}
    fn set_processed(&self, _header: &Header) {}
    fn revert_state_to_block(&self, _header: &Header) -> ProcessResult<()> {
        Ok(())
    }
    fn saved_state_key(&self) -> Vec<u8> {
        Vec::new()
    }
}

struct NoForks;

impl ForkDetector for NoForks {
    fn add_header(&self, _header: &Header, _hash: &Hash) -> ProcessResult<()> {
        Ok(())
    }
    fn set_rollback_nonce(&self, _nonce: u64) {}
    fn highest_final_block_nonce(&self) -> u64 {
        0
    }
    fn highest_final_block_hash(&self) -> Hash {
        EMPTY_HASH
    }
}

struct Nodes;

impl NodesCoordinator for Nodes {
    fn saved_state_key(&self) -> Vec<u8> {
        Vec::new()
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

struct Node {
    processor: ShardBlockProcessor,
    chain: Arc<BlockChain>,
    tracker: Arc<BlockTracker>,
}

impl Node {
    fn deliver(&self, meta: &MetaHeader, hash: Hash) {
        self.processor.on_meta_header_received(meta.clone(), hash);
    }
}

fn shard_genesis(shard_id: ShardId) -> ShardHeader {
    ShardHeader {
        shard_id,
        rand_seed: vec![0xBB; 4],
        ..Default::default()
    }
}

fn meta_genesis() -> MetaHeader {
    MetaHeader {
        rand_seed: vec![0xAA; 4],
        ..Default::default()
    }
}

fn make_node(storage: Arc<MemoryStorage>, coordinator: Arc<Coordinator>) -> Node {
    let genesis = shard_genesis(0);
    let other = shard_genesis(1);
    let meta = meta_genesis();
    let config = ProcessorConfig {
        max_meta_headers_in_one_shard_block: 1,
        ..ProcessorConfig::for_testing()
    };

    let chain = Arc::new(BlockChain::new(
        Header::Shard(genesis.clone()),
        calculate_hash(&genesis).unwrap(),
    ));
    let tracker = Arc::new(BlockTracker::new([
        TrackedHeader::new(Header::Shard(genesis.clone()), calculate_hash(&genesis).unwrap()),
        TrackedHeader::new(Header::Shard(other.clone()), calculate_hash(&other).unwrap()),
        TrackedHeader::new(Header::Meta(meta.clone()), calculate_hash(&meta).unwrap()),
    ]));

    let deps = ShardProcessorDependencies {
        accounts: Arc::new(FixedAccounts),
        tx_coordinator: coordinator,
        request_handler: Arc::new(NoRequests),
        epoch_start_trigger: Arc::new(EpochZero),
        fork_detector: Arc::new(NoForks),
        nodes_coordinator: Arc::new(Nodes),
        storage: storage.clone(),
        bootstrap_storer: Arc::new(StorageBootstrapper::new(storage)),
        data_pool: Arc::new(DataPool::new(
            config.headers_pool_capacity,
            config.mini_blocks_pool_capacity,
        )),
        chain: chain.clone(),
        block_tracker: tracker.clone(),
    };

    Node {
        processor: ShardBlockProcessor::new(deps, config).unwrap(),
        chain,
        tracker,
    }
}

/// `len` metachain headers, each notarizing a shard 1 block that sends
/// one miniblock to shard 0.
fn confirming_meta_chain(len: u8) -> Vec<(MetaHeader, Hash, MiniBlock)> {
    let mut chain = Vec::new();
    let mut prev = meta_genesis();
    for i in 1..=len {
        let mb = MiniBlock::new(1, 0, MiniBlockType::Transaction, vec![[i; 32], [i + 100; 32]]);
        let mbh = MiniBlockHeader {
            hash: calculate_hash(&mb).unwrap(),
            sender_shard_id: 1,
            receiver_shard_id: 0,
            tx_count: 2,
            mb_type: MiniBlockType::Transaction,
        };
        let meta = MetaHeader {
            nonce: prev.nonce + 1,
            round: prev.round + 1,
            prev_hash: calculate_hash(&prev).unwrap(),
            prev_rand_seed: prev.rand_seed.clone(),
            rand_seed: vec![i; 4],
            shard_info: vec![ShardData {
                shard_id: 1,
                nonce: u64::from(i),
                round: u64::from(i),
                shard_mini_block_headers: vec![mbh],
                tx_count: 2,
                ..Default::default()
            }],
            ..Default::default()
        };
        let hash = calculate_hash(&meta).unwrap();
        chain.push((meta.clone(), hash, mb));
        prev = meta;
    }
    chain
}

/// Fields a consensus round fixes before the processor fills the body.
fn next_template(prev: &ShardHeader) -> ShardHeader {
    ShardHeader {
        shard_id: 0,
        nonce: prev.nonce + 1,
        round: prev.round + 1,
        prev_hash: calculate_hash(prev).unwrap(),
        prev_rand_seed: prev.rand_seed.clone(),
        rand_seed: vec![(prev.nonce + 1) as u8; 4],
        ..Default::default()
    }
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

// =============================================================================
// PIPELINE
// =============================================================================

#[tokio::test]
async fn test_blocks_flow_from_proposer_to_validator_and_survive_restart() {
    let metas = confirming_meta_chain(5);

    let proposer_coordinator = Arc::new(Coordinator::default());
    for (_, _, mb) in &metas {
        proposer_coordinator
            .known
            .lock()
            .insert(calculate_hash(mb).unwrap(), mb.clone());
    }
    let proposer = make_node(Arc::new(MemoryStorage::new()), proposer_coordinator);

    let validator_storage = Arc::new(MemoryStorage::new());
    let validator = make_node(validator_storage.clone(), Arc::new(Coordinator::default()));

    for (meta, hash, _) in &metas {
        proposer.deliver(meta, *hash);
        validator.deliver(meta, *hash);
    }

    let mut prev = shard_genesis(0);
    for (meta, meta_hash, mb) in metas.iter().take(3) {
        let (header, body) = proposer
            .processor
            .create_block(next_template(&prev), deadline())
            .await
            .unwrap();
        assert_eq!(header.meta_block_hashes, vec![*meta_hash]);
        assert_eq!(body.mini_blocks, vec![mb.clone()]);
        assert_eq!(header.round, meta.round);

        let wrapped = Header::Shard(header.clone());
        validator
            .processor
            .process_block(&wrapped, &body, deadline())
            .await
            .unwrap();
        validator.processor.commit_block(&wrapped, &body).await.unwrap();
        proposer.processor.commit_block(&wrapped, &body).await.unwrap();
        prev = header;
    }

    let anchor = validator
        .tracker
        .get_last_cross_notarized(METACHAIN_SHARD_ID)
        .unwrap();
    assert_eq!(anchor.hash, metas[2].1);
    assert_eq!(
        validator.chain.current_header_hash(),
        Some(calculate_hash(&prev).unwrap())
    );

    validator.processor.flush_bootstrap().await;
    let storer = StorageBootstrapper::new(validator_storage.clone());
    let round = storer.highest_round().unwrap();
    assert_eq!(round, 3);
    let data = storer.get(round).unwrap();

    let restarted = make_node(validator_storage, Arc::new(Coordinator::default()));
    restarted.processor.restore_from_bootstrap(&data).unwrap();
    assert_eq!(
        restarted.chain.current_header_hash(),
        Some(calculate_hash(&prev).unwrap())
    );
    assert_eq!(
        restarted
            .tracker
            .get_last_cross_notarized(METACHAIN_SHARD_ID)
            .unwrap()
            .hash,
        metas[2].1
    );
    assert_eq!(restarted.chain.current_body().map(|b| b.mini_blocks.len()), Some(1));

    for (meta, hash, _) in &metas[3..] {
        restarted.deliver(meta, *hash);
    }

    let (header, body) = proposer
        .processor
        .create_block(next_template(&prev), deadline())
        .await
        .unwrap();
    assert_eq!(header.meta_block_hashes, vec![metas[3].1]);

    let wrapped = Header::Shard(header);
    restarted
        .processor
        .process_block(&wrapped, &body, deadline())
        .await
        .unwrap();
    restarted.processor.commit_block(&wrapped, &body).await.unwrap();
    assert_eq!(
        restarted
            .tracker
            .get_last_cross_notarized(METACHAIN_SHARD_ID)
            .unwrap()
            .hash,
        metas[3].1
    );
}

#[tokio::test]
async fn test_validator_rejects_block_with_tampered_body() {
    let metas = confirming_meta_chain(2);
    let proposer_coordinator = Arc::new(Coordinator::default());
    proposer_coordinator
        .known
        .lock()
        .insert(calculate_hash(&metas[0].2).unwrap(), metas[0].2.clone());
    let proposer = make_node(Arc::new(MemoryStorage::new()), proposer_coordinator);
    let validator = make_node(Arc::new(MemoryStorage::new()), Arc::new(Coordinator::default()));
    for (meta, hash, _) in &metas {
        proposer.deliver(meta, *hash);
        validator.deliver(meta, *hash);
    }

    let (header, _) = proposer
        .processor
        .create_block(next_template(&shard_genesis(0)), deadline())
        .await
        .unwrap();
    let tampered = Body::new(vec![metas[1].2.clone()]);

    let result = validator
        .processor
        .process_block(&Header::Shard(header), &tampered, deadline())
        .await;

    assert!(result.is_err());
    assert!(validator.chain.current_header().is_none());
}
