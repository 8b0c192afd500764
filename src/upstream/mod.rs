//! Upstream event sources.
//!
//! Two interchangeable implementations sit behind `UpstreamSource`: a
//! direct-chain reader that scans `eth_getLogs` in bounded windows, and a
//! client for a third-party indexing API with cursor pagination. The
//! orchestrator picks one at startup based on configuration.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{PerChainConfig, UpstreamSettings};
use crate::errors::{IndexerError, UpstreamError};
use crate::rate_limiter::SourceRateLimiter;
use crate::types::{RawPositionEvent, RawTransfer};

pub mod chain;
pub mod indexer;

pub use chain::ChainSource;
pub use indexer::IndexerApiSource;

/// A provider of raw position events and transfers for one position-manager
/// contract. All methods retry transient failures internally; what escapes
/// is either a final error or a decoded payload.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Short identifier used for checkpoint scoping and logging.
    fn name(&self) -> &str;

    /// Current chain head.
    async fn latest_block(&self) -> Result<u64, UpstreamError>;

    /// Timestamp of a mined block. Immutable once mined, so callers may
    /// cache the result indefinitely.
    async fn block_timestamp(&self, block_number: u64) -> Result<u64, UpstreamError>;

    /// All position events for a token in the inclusive block range,
    /// paginated internally until the range is exhausted.
    async fn fetch_events(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawPositionEvent>, UpstreamError>;

    /// Ownership transfers of the position NFT. `refresh` bypasses any
    /// source-local cache.
    async fn fetch_transfers(
        &self,
        token_id: u64,
        refresh: bool,
    ) -> Result<Vec<RawTransfer>, UpstreamError>;
}

/// Which implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Chain,
    IndexerApi,
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chain" | "rpc" => Ok(SourceKind::Chain),
            "api" | "indexer" | "indexer-api" => Ok(SourceKind::IndexerApi),
            other => Err(format!("Unknown source kind: {}", other)),
        }
    }
}

/// Builds the configured source. Fails fast when the chain entry lacks what
/// the chosen variant needs, so a batch never starts half-configured.
pub fn build_source(
    kind: SourceKind,
    chain: &PerChainConfig,
    settings: Arc<UpstreamSettings>,
    global_limiter: Arc<governor::DefaultDirectRateLimiter>,
) -> Result<Arc<dyn UpstreamSource>, IndexerError> {
    match kind {
        SourceKind::Chain => {
            let limiter = SourceRateLimiter::new(
                &format!("{}-chain", chain.chain_name),
                chain.rps_limit,
                chain.max_concurrent_requests,
                global_limiter,
                settings,
            );
            let source = ChainSource::new(chain, limiter)?;
            Ok(Arc::new(source))
        }
        SourceKind::IndexerApi => {
            let limiter = SourceRateLimiter::new(
                &format!("{}-api", chain.chain_name),
                chain.rps_limit,
                chain.max_concurrent_requests,
                global_limiter,
                settings.clone(),
            )
            .with_deadline(settings.http_timeout_ms);
            let source = IndexerApiSource::new(chain, settings, limiter)?;
            Ok(Arc::new(source))
        }
    }
}

/// Splits an inclusive block range into inclusive windows of at most
/// `max_window` blocks. The node rejects overly wide eth_getLogs ranges, so
/// every scan goes through this.
pub fn block_windows(from_block: u64, to_block: u64, max_window: u64) -> Vec<(u64, u64)> {
    if from_block > to_block || max_window == 0 {
        return Vec::new();
    }
    let mut windows = Vec::new();
    let mut start = from_block;
    while start <= to_block {
        let end = start.saturating_add(max_window - 1).min(to_block);
        windows.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    windows
}
