//! Position event ledger: backfills on-chain history for NFT-represented
//! LP positions into Postgres.
//!
//! 1. An upstream source (direct chain RPC or a third-party indexer API)
//!    yields raw position events and ERC-721 transfers, rate-limited and
//!    retried.
//! 2. The normalizer maps raw records into one canonical schema keyed by
//!    `txHash:logIndex`.
//! 3. The ledger writer bulk-upserts rows idempotently; re-syncing the same
//!    range is always safe.
//! 4. Per-token checkpoints make incremental syncs cheap and resumable; the
//!    orchestrator fans a batch of tokens across a bounded worker pool.

pub mod backfill;
pub mod checkpoint;
pub mod config;
pub mod database;
pub mod errors;
pub mod ledger;
pub mod metrics;
pub mod normalizer;
pub mod rate_limiter;
pub mod types;
pub mod upstream;

pub use backfill::{BackfillOrchestrator, ClearOutcome};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, PostgresCheckpointStore};
pub use config::Config;
pub use errors::{IndexerError, StorageError, UpstreamError};
pub use ledger::{LedgerCounts, LedgerStore, MemoryLedgerStore, PostgresLedgerStore};
pub use normalizer::EventNormalizer;
pub use types::{
    BackfillMode, BackfillRequest, BackfillSummary, Checkpoint, PositionEvent, PositionEventType,
    PositionTransfer, TokenBackfillResult, TokenSyncStage,
};
pub use upstream::{SourceKind, UpstreamSource};
