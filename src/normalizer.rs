//! Event normalizer: converts raw upstream payloads into canonical ledger
//! rows.
//!
//! Normalization is deterministic: the same raw record always produces the
//! same canonical row, which is what makes the ledger's overwrite-on-conflict
//! policy safe. The only side lookup is block number to block timestamp,
//! memoized here because timestamps are immutable once mined.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, U256};
use moka::future::Cache;
use tracing::warn;

use crate::errors::UpstreamError;
use crate::types::{
    ledger_id, u256_to_decimal, PositionEvent, PositionEventType, PositionTransfer,
    RawPositionEvent, RawTransfer,
};
use crate::upstream::UpstreamSource;

const Q96: f64 = 79228162514264337593543950336.0; // 2^96

#[derive(Debug, Default)]
pub struct NormalizerMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub dropped_records: AtomicU64,
}

pub struct EventNormalizer {
    /// Pool attributed to events whose payload does not carry one.
    fallback_pool: Address,
    timestamp_cache: Cache<u64, u64>,
    metrics: Arc<NormalizerMetrics>,
}

impl EventNormalizer {
    pub fn new(fallback_pool: Address) -> Self {
        Self {
            fallback_pool,
            timestamp_cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(3600))
                .build(),
            metrics: Arc::new(NormalizerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<NormalizerMetrics> {
        self.metrics.clone()
    }

    async fn resolve_timestamp<S: UpstreamSource + ?Sized>(
        &self,
        source: &S,
        block_number: u64,
    ) -> Result<u64, UpstreamError> {
        if let Some(cached) = self.timestamp_cache.get(&block_number).await {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

        let timestamp = source.block_timestamp(block_number).await?;
        self.timestamp_cache.insert(block_number, timestamp).await;
        Ok(timestamp)
    }

    /// Normalizes one raw event. Records missing their tx hash or block
    /// number cannot be keyed and are dropped with a warning; everything
    /// else maps, with unknown event names landing in `Other`.
    pub async fn normalize_event<S: UpstreamSource + ?Sized>(
        &self,
        source: &S,
        raw: &RawPositionEvent,
    ) -> Result<Option<PositionEvent>, UpstreamError> {
        let (tx_hash, block_number) = match (raw.tx_hash, raw.block_number) {
            (Some(tx), Some(block)) => (tx, block),
            _ => {
                self.metrics.dropped_records.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "ledger::normalize",
                    token_id = raw.token_id,
                    event_name = %raw.event_name,
                    "Dropping raw event without tx hash or block number"
                );
                return Ok(None);
            }
        };

        let unix_ts = match raw.unix_ts {
            Some(ts) => ts,
            None => self.resolve_timestamp(source, block_number).await?,
        };

        let event_type = PositionEventType::from_name(&raw.event_name);
        let liquidity_delta = match event_type {
            PositionEventType::Increase => raw.liquidity.and_then(u256_to_decimal),
            PositionEventType::Decrease => raw.liquidity.and_then(u256_to_decimal).map(|d| -d),
            _ => None,
        };

        Ok(Some(PositionEvent {
            id: ledger_id(&tx_hash, raw.log_index),
            token_id: raw.token_id,
            pool: raw.pool.unwrap_or(self.fallback_pool),
            block_number,
            tx_hash,
            log_index: raw.log_index,
            unix_ts,
            event_type,
            sender: raw.sender,
            owner: raw.owner,
            recipient: raw.recipient,
            tick_lower: raw.tick_lower,
            tick_upper: raw.tick_upper,
            tick: raw.tick,
            liquidity_delta,
            amount0: raw.amount0.and_then(u256_to_decimal),
            amount1: raw.amount1.and_then(u256_to_decimal),
            sqrt_price_x96: raw.sqrt_price_x96.and_then(u256_to_decimal),
            price1_per_0: raw.sqrt_price_x96.and_then(price_from_sqrt_x96),
            usd_value: None,
            metadata: raw.metadata.clone(),
        }))
    }

    /// Normalizes one raw transfer. `position_in_list` substitutes for the
    /// log index when the upstream record does not carry one natively.
    pub async fn normalize_transfer<S: UpstreamSource + ?Sized>(
        &self,
        source: &S,
        raw: &RawTransfer,
        position_in_list: usize,
    ) -> Result<Option<PositionTransfer>, UpstreamError> {
        let (tx_hash, block_number) = match (raw.tx_hash, raw.block_number) {
            (Some(tx), Some(block)) => (tx, block),
            _ => {
                self.metrics.dropped_records.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "ledger::normalize",
                    token_id = raw.token_id,
                    "Dropping raw transfer without tx hash or block number"
                );
                return Ok(None);
            }
        };

        let unix_ts = match raw.unix_ts {
            Some(ts) => ts,
            None => self.resolve_timestamp(source, block_number).await?,
        };
        let log_index = raw.log_index.unwrap_or(position_in_list as u64);

        Ok(Some(PositionTransfer {
            id: ledger_id(&tx_hash, log_index),
            token_id: raw.token_id,
            from: raw.from,
            to: raw.to,
            block_number,
            tx_hash,
            log_index,
            unix_ts,
            metadata: raw.metadata.clone(),
        }))
    }

    pub async fn normalize_events<S: UpstreamSource + ?Sized>(
        &self,
        source: &S,
        raws: &[RawPositionEvent],
    ) -> Result<Vec<PositionEvent>, UpstreamError> {
        let mut events = Vec::with_capacity(raws.len());
        for raw in raws {
            if let Some(event) = self.normalize_event(source, raw).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    pub async fn normalize_transfers<S: UpstreamSource + ?Sized>(
        &self,
        source: &S,
        raws: &[RawTransfer],
    ) -> Result<Vec<PositionTransfer>, UpstreamError> {
        let mut transfers = Vec::with_capacity(raws.len());
        for (position, raw) in raws.iter().enumerate() {
            if let Some(transfer) = self.normalize_transfer(source, raw, position).await? {
                transfers.push(transfer);
            }
        }
        Ok(transfers)
    }
}

/// Raw-units price of token1 per token0: (sqrt_price_x96 / 2^96)^2. Token
/// decimal scaling is a presentation concern left to downstream consumers.
fn price_from_sqrt_x96(sqrt_price_x96: U256) -> Option<f64> {
    let sqrt: f64 = sqrt_price_x96.to_string().parse().ok()?;
    if !sqrt.is_finite() || sqrt <= 0.0 {
        return None;
    }
    let ratio = sqrt / Q96;
    Some(ratio * ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ethers::types::H256;

    /// Timestamp-only stub. Event and transfer fetches are never exercised
    /// by normalizer tests.
    struct StubSource {
        timestamp_calls: AtomicU64,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                timestamp_calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl UpstreamSource for StubSource {
        fn name(&self) -> &str {
            "stub"
        }

        async fn latest_block(&self) -> Result<u64, UpstreamError> {
            Ok(1_000)
        }

        async fn block_timestamp(&self, block_number: u64) -> Result<u64, UpstreamError> {
            self.timestamp_calls.fetch_add(1, Ordering::SeqCst);
            Ok(1_600_000_000 + block_number)
        }

        async fn fetch_events(
            &self,
            _token_id: u64,
            _from_block: u64,
            _to_block: u64,
        ) -> Result<Vec<RawPositionEvent>, UpstreamError> {
            unimplemented!("not used by normalizer tests")
        }

        async fn fetch_transfers(
            &self,
            _token_id: u64,
            _refresh: bool,
        ) -> Result<Vec<RawTransfer>, UpstreamError> {
            unimplemented!("not used by normalizer tests")
        }
    }

    fn raw_event(name: &str) -> RawPositionEvent {
        RawPositionEvent {
            token_id: 7,
            event_name: name.to_string(),
            block_number: Some(100),
            tx_hash: Some(H256::from_low_u64_be(0xbeef)),
            log_index: 2,
            unix_ts: None,
            pool: None,
            sender: Some(Address::repeat_byte(0x01)),
            owner: None,
            recipient: None,
            tick_lower: Some(-60),
            tick_upper: Some(60),
            tick: None,
            liquidity: Some(U256::from(1_000u64)),
            amount0: Some(U256::from(11u64)),
            amount1: Some(U256::from(22u64)),
            sqrt_price_x96: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn maps_event_names_to_canonical_types() {
        let normalizer = EventNormalizer::new(Address::repeat_byte(0xaa));
        let source = StubSource::new();

        let cases = [
            ("increase", PositionEventType::Increase),
            ("decrease", PositionEventType::Decrease),
            ("collect", PositionEventType::Collect),
            ("unknownThing", PositionEventType::Other),
        ];
        for (name, expected) in cases {
            let event = normalizer
                .normalize_event(&source, &raw_event(name))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.event_type, expected, "event name {}", name);
        }
    }

    #[tokio::test]
    async fn liquidity_delta_is_signed_by_direction() {
        let normalizer = EventNormalizer::new(Address::repeat_byte(0xaa));
        let source = StubSource::new();

        let increase = normalizer
            .normalize_event(&source, &raw_event("increase"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(increase.liquidity_delta, Some(rust_decimal::Decimal::from(1_000)));

        let decrease = normalizer
            .normalize_event(&source, &raw_event("decrease"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decrease.liquidity_delta, Some(rust_decimal::Decimal::from(-1_000)));

        let collect = normalizer
            .normalize_event(&source, &raw_event("collect"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(collect.liquidity_delta, None);
    }

    #[tokio::test]
    async fn drops_events_missing_identifiers() {
        let normalizer = EventNormalizer::new(Address::repeat_byte(0xaa));
        let source = StubSource::new();

        let mut raw = raw_event("increase");
        raw.tx_hash = None;
        assert!(normalizer.normalize_event(&source, &raw).await.unwrap().is_none());

        let mut raw = raw_event("increase");
        raw.block_number = None;
        assert!(normalizer.normalize_event(&source, &raw).await.unwrap().is_none());

        assert_eq!(normalizer.metrics().dropped_records.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timestamp_lookups_are_memoized() {
        let normalizer = EventNormalizer::new(Address::repeat_byte(0xaa));
        let source = StubSource::new();

        for _ in 0..5 {
            let event = normalizer
                .normalize_event(&source, &raw_event("increase"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.unix_ts, 1_600_000_100);
        }
        assert_eq!(source.timestamp_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn supplied_timestamp_skips_lookup() {
        let normalizer = EventNormalizer::new(Address::repeat_byte(0xaa));
        let source = StubSource::new();

        let mut raw = raw_event("collect");
        raw.unix_ts = Some(42);
        let event = normalizer.normalize_event(&source, &raw).await.unwrap().unwrap();
        assert_eq!(event.unix_ts, 42);
        assert_eq!(source.timestamp_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transfer_log_index_falls_back_to_list_position() {
        let normalizer = EventNormalizer::new(Address::repeat_byte(0xaa));
        let source = StubSource::new();

        let raws = vec![
            RawTransfer {
                token_id: 7,
                from: Address::zero(),
                to: Address::repeat_byte(0x02),
                block_number: Some(50),
                tx_hash: Some(H256::from_low_u64_be(1)),
                log_index: None,
                unix_ts: Some(10),
                metadata: None,
            },
            RawTransfer {
                token_id: 7,
                from: Address::repeat_byte(0x02),
                to: Address::repeat_byte(0x03),
                block_number: Some(60),
                tx_hash: Some(H256::from_low_u64_be(2)),
                log_index: Some(9),
                unix_ts: Some(11),
                metadata: None,
            },
        ];

        let transfers = normalizer.normalize_transfers(&source, &raws).await.unwrap();
        assert_eq!(transfers[0].log_index, 0);
        assert_eq!(transfers[1].log_index, 9);
        assert_eq!(transfers[1].id, ledger_id(&H256::from_low_u64_be(2), 9));
    }

    #[test]
    fn price_from_sqrt_is_square_of_ratio() {
        // sqrt_price_x96 == 2^96 means a price of exactly 1.
        let one = U256::from(2).pow(U256::from(96));
        let price = price_from_sqrt_x96(one).unwrap();
        assert!((price - 1.0).abs() < 1e-9);

        let double = one * U256::from(2);
        let price = price_from_sqrt_x96(double).unwrap();
        assert!((price - 4.0).abs() < 1e-9);

        assert!(price_from_sqrt_x96(U256::zero()).is_none());
    }
}
