use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use tokio_util::sync::CancellationToken;

use position_ledger::{
    backfill::BackfillOrchestrator,
    checkpoint::MemoryCheckpointStore,
    config::{BackfillSettings, PerChainConfig},
    ledger::MemoryLedgerStore,
    normalizer::EventNormalizer,
    types::{RawPositionEvent, RawTransfer},
};

pub mod mocks;

use mocks::FakeUpstream;

pub const TEST_POOL: Address = Address::repeat_byte(0xcd);

/// Everything a backfill test needs, wired against in-memory stores and the
/// scriptable fake source. Cancelling the token stops the orchestrator the
/// same way a real shutdown does.
pub struct TestHarness {
    pub orchestrator: Arc<BackfillOrchestrator>,
    pub source: Arc<FakeUpstream>,
    pub ledger: Arc<MemoryLedgerStore>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub cancellation: CancellationToken,
}

impl TestHarness {
    pub fn new(genesis_block: u64, latest_block: u64) -> Self {
        let source = Arc::new(FakeUpstream::new(latest_block));
        let ledger = Arc::new(MemoryLedgerStore::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let normalizer = Arc::new(EventNormalizer::new(TEST_POOL));
        let cancellation = CancellationToken::new();
        let orchestrator = Arc::new(BackfillOrchestrator::new(
            source.clone(),
            checkpoints.clone(),
            ledger.clone(),
            normalizer,
            test_settings(),
            &test_chain(genesis_block),
            cancellation.clone(),
        ));
        Self {
            orchestrator,
            source,
            ledger,
            checkpoints,
            cancellation,
        }
    }
}

pub fn test_settings() -> BackfillSettings {
    BackfillSettings {
        concurrency: 4,
        staleness_window_secs: 3600,
        upsert_chunk_size: 500,
        auto_sync_interval_secs: 300,
    }
}

pub fn test_chain(genesis_block: u64) -> PerChainConfig {
    PerChainConfig {
        chain_id: 14,
        chain_name: "flare".to_string(),
        rpc_url: "http://127.0.0.1:9650".to_string(),
        position_manager: Address::repeat_byte(0x11),
        genesis_block,
        max_blocks_per_query: Some(2_000),
        rps_limit: None,
        max_concurrent_requests: None,
        indexer_api_url: None,
        indexer_api_key: None,
        avg_block_time_seconds: Some(1.8),
        is_test_environment: Some(true),
    }
}

/// Deterministic tx hash per `(token, block, log_index)` so re-scripted
/// fixtures land on the same ledger keys run after run.
fn tx_seed(token_id: u64, block: u64, log_index: u64, salt: u64) -> H256 {
    H256::from_low_u64_be(token_id * 1_000_000 + block * 100 + log_index * 10 + salt)
}

pub fn raw_event(token_id: u64, name: &str, block: u64, log_index: u64) -> RawPositionEvent {
    RawPositionEvent {
        token_id,
        event_name: name.to_string(),
        block_number: Some(block),
        tx_hash: Some(tx_seed(token_id, block, log_index, 1)),
        log_index,
        unix_ts: Some(1_700_000_000 + block),
        pool: Some(TEST_POOL),
        sender: Some(Address::repeat_byte(0x01)),
        owner: Some(Address::repeat_byte(0x02)),
        recipient: None,
        tick_lower: Some(-887_220),
        tick_upper: Some(887_220),
        tick: None,
        liquidity: Some(U256::from(1_000_000u64)),
        amount0: Some(U256::from(500u64)),
        amount1: Some(U256::from(600u64)),
        sqrt_price_x96: None,
        metadata: None,
    }
}

pub fn raw_transfer(
    token_id: u64,
    from: Address,
    to: Address,
    block: u64,
    log_index: u64,
) -> RawTransfer {
    RawTransfer {
        token_id,
        from,
        to,
        block_number: Some(block),
        tx_hash: Some(tx_seed(token_id, block, log_index, 7)),
        log_index: Some(log_index),
        unix_ts: Some(1_700_000_000 + block),
        metadata: None,
    }
}
