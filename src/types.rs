//! # Core Type Definitions
//!
//! This module serves as the single source of truth for the shared data
//! structures used throughout the indexer: raw upstream payloads, the
//! canonical ledger rows, checkpoints, and backfill bookkeeping.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

//================================================================================================//
//                                      EVENT CLASSIFICATION                                      //
//================================================================================================//

/// Canonical classification of a position event. Anything the upstream
/// reports that is not one of the three liquidity operations maps to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionEventType {
    Increase,
    Decrease,
    Collect,
    Other,
}

impl PositionEventType {
    /// Maps an upstream event name onto the canonical classification.
    /// Matching is case-insensitive; unrecognized names land in `Other`
    /// rather than failing the batch.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "increase" | "increaseliquidity" => PositionEventType::Increase,
            "decrease" | "decreaseliquidity" => PositionEventType::Decrease,
            "collect" => PositionEventType::Collect,
            _ => PositionEventType::Other,
        }
    }

    pub fn as_i16(&self) -> i16 {
        match self {
            PositionEventType::Other => 0,
            PositionEventType::Increase => 1,
            PositionEventType::Decrease => 2,
            PositionEventType::Collect => 3,
        }
    }
}

impl TryFrom<i16> for PositionEventType {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PositionEventType::Other),
            1 => Ok(PositionEventType::Increase),
            2 => Ok(PositionEventType::Decrease),
            3 => Ok(PositionEventType::Collect),
            other => Err(format!("Unknown event type id: {}", other)),
        }
    }
}

impl std::fmt::Display for PositionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionEventType::Increase => write!(f, "increase"),
            PositionEventType::Decrease => write!(f, "decrease"),
            PositionEventType::Collect => write!(f, "collect"),
            PositionEventType::Other => write!(f, "other"),
        }
    }
}

//================================================================================================//
//                                       RAW UPSTREAM SHAPES                                      //
//================================================================================================//

/// A position event as fetched from an upstream source, before normalization.
/// Direct chain reads decode logs into this shape; indexer API responses
/// deserialize into it. Field availability varies by source: a record
/// missing its tx hash or block number cannot be keyed and the normalizer
/// drops it with a warning instead of guessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPositionEvent {
    pub token_id: u64,
    pub event_name: String,
    pub block_number: Option<u64>,
    pub tx_hash: Option<H256>,
    pub log_index: u64,
    /// Unix timestamp, if the source already knows it. Direct chain reads
    /// leave this empty and the normalizer resolves it per block.
    pub unix_ts: Option<u64>,
    pub pool: Option<Address>,
    pub sender: Option<Address>,
    pub owner: Option<Address>,
    pub recipient: Option<Address>,
    pub tick_lower: Option<i32>,
    pub tick_upper: Option<i32>,
    pub tick: Option<i32>,
    pub liquidity: Option<U256>,
    pub amount0: Option<U256>,
    pub amount1: Option<U256>,
    pub sqrt_price_x96: Option<U256>,
    pub metadata: Option<serde_json::Value>,
}

/// An ERC-721 transfer of a position token, before normalization.
/// Indexer APIs often omit the log index; the normalizer then assigns one
/// from the record's position in the returned list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransfer {
    pub token_id: u64,
    pub from: Address,
    pub to: Address,
    pub block_number: Option<u64>,
    pub tx_hash: Option<H256>,
    pub log_index: Option<u64>,
    pub unix_ts: Option<u64>,
    pub metadata: Option<serde_json::Value>,
}

//================================================================================================//
//                                       CANONICAL LEDGER ROWS                                    //
//================================================================================================//

/// A fully normalized position event, keyed by `tx_hash:log_index`. This is
/// the exact shape persisted to the `position_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    /// Natural key: lowercase hex tx hash, a colon, then the log index.
    pub id: String,
    pub token_id: u64,
    pub pool: Address,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    pub unix_ts: u64,
    pub event_type: PositionEventType,
    pub sender: Option<Address>,
    pub owner: Option<Address>,
    pub recipient: Option<Address>,
    pub tick_lower: Option<i32>,
    pub tick_upper: Option<i32>,
    pub tick: Option<i32>,
    /// Signed liquidity change: positive for increases, negative for
    /// decreases, absent for collects and unclassified events.
    pub liquidity_delta: Option<Decimal>,
    pub amount0: Option<Decimal>,
    pub amount1: Option<Decimal>,
    pub sqrt_price_x96: Option<Decimal>,
    pub price1_per_0: Option<f64>,
    pub usd_value: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

/// A normalized ownership transfer, keyed the same way as events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionTransfer {
    pub id: String,
    pub token_id: u64,
    pub from: Address,
    pub to: Address,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    pub unix_ts: u64,
    pub metadata: Option<serde_json::Value>,
}

/// Builds the natural ledger key from the log coordinates. The same log
/// always produces the same key, which is what makes re-runs idempotent.
pub fn ledger_id(tx_hash: &H256, log_index: u64) -> String {
    format!("{:#x}:{}", tx_hash, log_index)
}

/// Lossless-enough U256 to NUMERIC conversion via decimal string. Values
/// beyond Decimal's 96-bit mantissa fall back to None instead of truncating.
pub fn u256_to_decimal(value: U256) -> Option<Decimal> {
    Decimal::from_str(&value.to_string()).ok()
}

//================================================================================================//
//                                          CHECKPOINTS                                           //
//================================================================================================//

/// Per-token sync cursor. `last_block` is the highest block whose logs have
/// been durably written for this token under the named source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: String,
    pub token_id: u64,
    pub last_block: u64,
    pub last_fetched_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(source: impl Into<String>, token_id: u64, last_block: u64) -> Self {
        Self {
            source: source.into(),
            token_id,
            last_block,
            last_fetched_at: Utc::now(),
        }
    }

    /// A checkpoint is fresh when it was fetched within `window`. Fresh
    /// checkpoints let the auto-sync path skip tokens entirely.
    pub fn is_fresh(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_fetched_at) < window
    }
}

//================================================================================================//
//                                     BACKFILL BOOKKEEPING                                       //
//================================================================================================//

/// How far back a backfill reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackfillMode {
    /// Rescan from the position manager's deployment block, ignoring any
    /// stored checkpoint. Upserts make the rescan safe.
    Full,
    /// Resume from the stored checkpoint, or fall back to the deployment
    /// block when the token has never been synced.
    Since,
}

impl FromStr for BackfillMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(BackfillMode::Full),
            "since" | "incremental" => Ok(BackfillMode::Since),
            other => Err(format!("Unknown backfill mode: {}", other)),
        }
    }
}

impl std::fmt::Display for BackfillMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackfillMode::Full => write!(f, "full"),
            BackfillMode::Since => write!(f, "since"),
        }
    }
}

/// One backfill batch as requested by the CLI or the auto-sync sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub token_ids: Vec<u64>,
    pub mode: BackfillMode,
    /// Explicit lower bound override. Takes precedence over both the
    /// checkpoint and the deployment block.
    pub since_block: Option<u64>,
    /// Explicit upper bound. Defaults to the chain head at batch start.
    pub to_block: Option<u64>,
    /// Worker lanes for this batch; defaults to the configured value.
    pub concurrency: Option<usize>,
}

impl BackfillRequest {
    pub fn new(token_ids: Vec<u64>, mode: BackfillMode) -> Self {
        Self {
            token_ids,
            mode,
            since_block: None,
            to_block: None,
            concurrency: None,
        }
    }
}

/// Lifecycle of a single token inside a backfill batch. Tokens move through
/// the stages strictly in order; a failure at any stage parks the token in
/// `Failed` without disturbing its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenSyncStage {
    Pending,
    FetchingTransfers,
    FetchingEvents,
    Normalizing,
    Writing,
    CheckpointAdvance,
    Done,
    Failed,
}

impl std::fmt::Display for TokenSyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSyncStage::Pending => write!(f, "pending"),
            TokenSyncStage::FetchingTransfers => write!(f, "fetching_transfers"),
            TokenSyncStage::FetchingEvents => write!(f, "fetching_events"),
            TokenSyncStage::Normalizing => write!(f, "normalizing"),
            TokenSyncStage::Writing => write!(f, "writing"),
            TokenSyncStage::CheckpointAdvance => write!(f, "checkpoint_advance"),
            TokenSyncStage::Done => write!(f, "done"),
            TokenSyncStage::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one token's backfill, reported inside the batch summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBackfillResult {
    pub token_id: u64,
    pub stage: TokenSyncStage,
    pub from_block: u64,
    pub to_block: u64,
    pub events_written: usize,
    pub transfers_written: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Aggregate result of a backfill batch. `failed > 0` never aborts the
/// batch; callers decide what a partial failure means for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_elapsed_ms: u64,
    pub results: Vec<TokenBackfillResult>,
}

impl BackfillSummary {
    pub fn from_results(results: Vec<TokenBackfillResult>, total_elapsed_ms: u64) -> Self {
        let total = results.len();
        let failed = results.iter().filter(|r| r.error.is_some()).count();
        Self {
            total,
            successful: total - failed,
            failed,
            total_elapsed_ms,
            results,
        }
    }
}
