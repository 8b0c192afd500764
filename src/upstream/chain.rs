//! Direct-chain event source.
//!
//! Scans the position manager's logs over JSON-RPC with `eth_getLogs`,
//! windowed to the provider's maximum range. Log decoding is positional:
//! the three liquidity events and the ERC-721 transfer have fixed layouts,
//! so no ABI machinery is needed.

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Filter, Log, ValueOrArray, H256, U256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::PerChainConfig;
use crate::errors::{IndexerError, UpstreamError};
use crate::rate_limiter::SourceRateLimiter;
use crate::types::{RawPositionEvent, RawTransfer};
use crate::upstream::{block_windows, UpstreamSource};

// keccak256("IncreaseLiquidity(uint256,uint128,uint256,uint256)")
const INCREASE_LIQUIDITY_TOPIC: H256 = H256([
    0x30, 0x67, 0x04, 0x8b, 0xee, 0xe3, 0x1b, 0x25, 0xb2, 0xf1, 0x68, 0x1f, 0x88, 0xda, 0xc8, 0x38,
    0xc8, 0xbb, 0xa3, 0x6a, 0xf2, 0x5b, 0xfb, 0x2b, 0x7c, 0xf7, 0x47, 0x3a, 0x58, 0x47, 0xe3, 0x5f,
]);
// keccak256("DecreaseLiquidity(uint256,uint128,uint256,uint256)")
const DECREASE_LIQUIDITY_TOPIC: H256 = H256([
    0x26, 0xf6, 0xa0, 0x48, 0xee, 0x91, 0x38, 0xf2, 0xc0, 0xce, 0x26, 0x6f, 0x32, 0x2c, 0xb9, 0x92,
    0x28, 0xe8, 0xd6, 0x19, 0xae, 0x2b, 0xff, 0x30, 0xc6, 0x7f, 0x8d, 0xcf, 0x9d, 0x23, 0x77, 0xb4,
]);
// keccak256("Collect(uint256,address,uint256,uint256)")
const COLLECT_TOPIC: H256 = H256([
    0x40, 0xd0, 0xef, 0xd1, 0xa5, 0x3d, 0x60, 0xec, 0xbf, 0x40, 0x97, 0x1b, 0x9d, 0xaf, 0x7d, 0xc9,
    0x01, 0x78, 0xc3, 0xaa, 0xdc, 0x7a, 0xab, 0x17, 0x65, 0x63, 0x27, 0x38, 0xfa, 0x8b, 0x8f, 0x01,
]);
// keccak256("Transfer(address,address,uint256)")
const ERC721_TRANSFER_TOPIC: H256 = H256([
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d, 0xaa,
    0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23, 0xb3, 0xef,
]);

fn h256_topic_addr(t: &H256) -> Address {
    Address::from_slice(&t.as_bytes()[12..32]) // last 20 bytes
}

fn token_id_to_topic(token_id: u64) -> H256 {
    let mut buf = [0u8; 32];
    U256::from(token_id).to_big_endian(&mut buf);
    H256::from(buf)
}

fn topic_to_token_id(topic: &H256) -> u64 {
    U256::from_big_endian(topic.as_bytes()).low_u64()
}

pub struct ChainSource {
    name: String,
    provider: Arc<Provider<Http>>,
    position_manager: Address,
    genesis_block: u64,
    max_blocks_per_query: u64,
    rate_limiter: SourceRateLimiter,
}

impl ChainSource {
    pub fn new(chain: &PerChainConfig, rate_limiter: SourceRateLimiter) -> Result<Self, IndexerError> {
        let provider = Provider::<Http>::try_from(chain.rpc_url.as_str())
            .map_err(|e| IndexerError::Config(format!("Invalid rpc_url for {}: {}", chain.chain_name, e)))?;
        Ok(Self {
            name: format!("{}-chain", chain.chain_name),
            provider: Arc::new(provider),
            position_manager: chain.position_manager,
            genesis_block: chain.genesis_block,
            max_blocks_per_query: chain.max_blocks_per_query(),
            rate_limiter,
        })
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, UpstreamError> {
        self.rate_limiter
            .execute("eth_getLogs", || {
                let provider = self.provider.clone();
                let filter = filter.clone();
                async move { provider.get_logs(&filter).await.map_err(UpstreamError::from) }
            })
            .await
    }

    /// Decodes one position-manager log into a raw event, or None when the
    /// log does not look like one of the three liquidity events.
    fn decode_position_log(log: &Log) -> Option<RawPositionEvent> {
        let topic0 = log.topics.first()?;
        if log.topics.len() < 2 {
            warn!(target: "ledger::chain", "Position log with missing tokenId topic, skipping");
            return None;
        }
        let token_id = topic_to_token_id(&log.topics[1]);

        let event_name = match *topic0 {
            t if t == INCREASE_LIQUIDITY_TOPIC => "IncreaseLiquidity",
            t if t == DECREASE_LIQUIDITY_TOPIC => "DecreaseLiquidity",
            t if t == COLLECT_TOPIC => "Collect",
            _ => return None,
        };

        if log.data.len() < 96 {
            warn!(
                target: "ledger::chain",
                token_id,
                event_name,
                "Position log with truncated data, skipping"
            );
            return None;
        }

        // IncreaseLiquidity / DecreaseLiquidity data layout (96 bytes):
        // [0..32]: liquidity (uint128, right-aligned)
        // [32..64]: amount0 (uint256)
        // [64..96]: amount1 (uint256)
        //
        // Collect swaps the first word for the recipient address,
        // right-aligned in [12..32].
        let (liquidity, recipient) = if event_name == "Collect" {
            (None, Some(Address::from_slice(&log.data[12..32])))
        } else {
            (Some(U256::from_big_endian(&log.data[0..32])), None)
        };
        let amount0 = U256::from_big_endian(&log.data[32..64]);
        let amount1 = U256::from_big_endian(&log.data[64..96]);

        Some(RawPositionEvent {
            token_id,
            event_name: event_name.to_string(),
            block_number: log.block_number.map(|b| b.as_u64()),
            tx_hash: log.transaction_hash,
            log_index: log.log_index.map(|i| i.as_u64()).unwrap_or(0),
            unix_ts: None,
            pool: None,
            sender: None,
            owner: None,
            recipient,
            tick_lower: None,
            tick_upper: None,
            tick: None,
            liquidity,
            amount0: Some(amount0),
            amount1: Some(amount1),
            sqrt_price_x96: None,
            metadata: None,
        })
    }

    /// ERC-721 Transfer: Transfer(address indexed from, address indexed to,
    /// uint256 indexed tokenId). Topics: [signature, from, to, tokenId].
    fn decode_transfer_log(log: &Log) -> Option<RawTransfer> {
        if log.topics.len() < 4 || log.topics[0] != ERC721_TRANSFER_TOPIC {
            return None;
        }
        Some(RawTransfer {
            token_id: topic_to_token_id(&log.topics[3]),
            from: h256_topic_addr(&log.topics[1]),
            to: h256_topic_addr(&log.topics[2]),
            block_number: log.block_number.map(|b| b.as_u64()),
            tx_hash: log.transaction_hash,
            log_index: log.log_index.map(|i| i.as_u64()),
            unix_ts: None,
            metadata: None,
        })
    }
}

#[async_trait]
impl UpstreamSource for ChainSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn latest_block(&self) -> Result<u64, UpstreamError> {
        let block = self
            .rate_limiter
            .execute("eth_blockNumber", || {
                let provider = self.provider.clone();
                async move { provider.get_block_number().await.map_err(UpstreamError::from) }
            })
            .await?;
        Ok(block.as_u64())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, UpstreamError> {
        let block = self
            .rate_limiter
            .execute("eth_getBlockByNumber", || {
                let provider = self.provider.clone();
                async move { provider.get_block(block_number).await.map_err(UpstreamError::from) }
            })
            .await?
            .ok_or(UpstreamError::BlockNotFound(block_number))?;
        Ok(block.timestamp.as_u64())
    }

    async fn fetch_events(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawPositionEvent>, UpstreamError> {
        let token_topic = token_id_to_topic(token_id);
        let mut events = Vec::new();

        for (window_from, window_to) in block_windows(from_block, to_block, self.max_blocks_per_query) {
            let filter = Filter::new()
                .address(self.position_manager)
                .from_block(window_from)
                .to_block(window_to)
                .topic0(ValueOrArray::Array(vec![
                    INCREASE_LIQUIDITY_TOPIC,
                    DECREASE_LIQUIDITY_TOPIC,
                    COLLECT_TOPIC,
                ]))
                .topic1(token_topic);

            let logs = self.get_logs(&filter).await?;
            debug!(
                target: "ledger::chain",
                token_id,
                window_from,
                window_to,
                logs = logs.len(),
                "Scanned position log window"
            );
            events.extend(logs.iter().filter_map(Self::decode_position_log));
        }

        events.sort_by_key(|e| (e.block_number.unwrap_or(0), e.log_index));
        Ok(events)
    }

    async fn fetch_transfers(
        &self,
        token_id: u64,
        _refresh: bool,
    ) -> Result<Vec<RawTransfer>, UpstreamError> {
        // Ownership history spans the contract's whole lifetime, so the scan
        // always starts at the deployment block.
        let to_block = self.latest_block().await?;
        let token_topic = token_id_to_topic(token_id);
        let mut transfers = Vec::new();

        for (window_from, window_to) in
            block_windows(self.genesis_block, to_block, self.max_blocks_per_query)
        {
            let filter = Filter::new()
                .address(self.position_manager)
                .from_block(window_from)
                .to_block(window_to)
                .topic0(ERC721_TRANSFER_TOPIC)
                .topic3(token_topic);

            let logs = self.get_logs(&filter).await?;
            transfers.extend(logs.iter().filter_map(Self::decode_transfer_log));
        }

        transfers.sort_by_key(|t| (t.block_number.unwrap_or(0), t.log_index.unwrap_or(0)));
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, U64};

    fn word(value: u64) -> [u8; 32] {
        let mut buf = [0u8; 32];
        U256::from(value).to_big_endian(&mut buf);
        buf
    }

    fn position_log(topic0: H256, token_id: u64, data: Vec<u8>) -> Log {
        Log {
            address: Address::repeat_byte(0x11),
            topics: vec![topic0, token_id_to_topic(token_id)],
            data: Bytes::from(data),
            block_number: Some(U64::from(120)),
            transaction_hash: Some(H256::from_low_u64_be(0xfeed)),
            log_index: Some(U256::from(3)),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_increase_liquidity_log() {
        let mut data = Vec::new();
        data.extend_from_slice(&word(5_000)); // liquidity
        data.extend_from_slice(&word(111)); // amount0
        data.extend_from_slice(&word(222)); // amount1

        let raw = ChainSource::decode_position_log(&position_log(
            INCREASE_LIQUIDITY_TOPIC,
            22003,
            data,
        ))
        .unwrap();

        assert_eq!(raw.token_id, 22003);
        assert_eq!(raw.event_name, "IncreaseLiquidity");
        assert_eq!(raw.block_number, Some(120));
        assert_eq!(raw.log_index, 3);
        assert_eq!(raw.liquidity, Some(U256::from(5_000)));
        assert_eq!(raw.amount0, Some(U256::from(111)));
        assert_eq!(raw.amount1, Some(U256::from(222)));
        assert_eq!(raw.recipient, None);
    }

    #[test]
    fn decodes_collect_log_with_recipient() {
        let recipient = Address::repeat_byte(0x42);
        let mut data = vec![0u8; 12];
        data.extend_from_slice(recipient.as_bytes());
        data.extend_from_slice(&word(7));
        data.extend_from_slice(&word(8));

        let raw = ChainSource::decode_position_log(&position_log(COLLECT_TOPIC, 9, data)).unwrap();
        assert_eq!(raw.event_name, "Collect");
        assert_eq!(raw.recipient, Some(recipient));
        assert_eq!(raw.liquidity, None);
        assert_eq!(raw.amount0, Some(U256::from(7)));
    }

    #[test]
    fn skips_truncated_and_foreign_logs() {
        let truncated = position_log(DECREASE_LIQUIDITY_TOPIC, 1, vec![0u8; 40]);
        assert!(ChainSource::decode_position_log(&truncated).is_none());

        let foreign = position_log(H256::repeat_byte(0x99), 1, vec![0u8; 96]);
        assert!(ChainSource::decode_position_log(&foreign).is_none());
    }

    #[test]
    fn decodes_erc721_transfer_log() {
        let from = Address::repeat_byte(0x01);
        let to = Address::repeat_byte(0x02);
        let log = Log {
            address: Address::repeat_byte(0x11),
            topics: vec![
                ERC721_TRANSFER_TOPIC,
                H256::from(from),
                H256::from(to),
                token_id_to_topic(22326),
            ],
            data: Bytes::default(),
            block_number: Some(U64::from(77)),
            transaction_hash: Some(H256::from_low_u64_be(0xabc)),
            log_index: Some(U256::from(1)),
            ..Default::default()
        };

        let raw = ChainSource::decode_transfer_log(&log).unwrap();
        assert_eq!(raw.token_id, 22326);
        assert_eq!(raw.from, from);
        assert_eq!(raw.to, to);
        assert_eq!(raw.block_number, Some(77));
        assert_eq!(raw.log_index, Some(1));
    }

    #[test]
    fn token_topic_round_trips() {
        for token_id in [0u64, 1, 22003, u64::MAX] {
            assert_eq!(topic_to_token_id(&token_id_to_topic(token_id)), token_id);
        }
    }
}
