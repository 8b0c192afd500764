//! Indexer-API event source.
//!
//! Client for a third-party indexing service that has already decoded the
//! position manager's logs. Both endpoints paginate with an opaque
//! `pageToken` cursor; the loop re-issues the request until the response
//! carries no `nextPageToken`. Record fields arrive as JSON strings for
//! anything wider than 64 bits, so parsing is lenient: a malformed optional
//! field degrades to absent and the normalizer decides whether the record
//! survives.

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use moka::future::Cache;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{PerChainConfig, UpstreamSettings};
use crate::errors::{IndexerError, UpstreamError};
use crate::rate_limiter::SourceRateLimiter;
use crate::types::{RawPositionEvent, RawTransfer};
use crate::upstream::UpstreamSource;

/// Hard cap on pages per request, so a server that keeps handing out
/// cursors cannot pin a worker forever.
const MAX_PAGES: usize = 1_000;

const ERROR_BODY_LIMIT: usize = 512;

const TRANSFER_CACHE_CAPACITY: u64 = 1_000;
const TRANSFER_CACHE_TTL_SECS: u64 = 600;

#[derive(Debug, Deserialize)]
struct EventsPage {
    #[serde(default)]
    events: Vec<ApiEvent>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEvent {
    #[serde(rename = "eventName")]
    event_name: String,
    #[serde(rename = "blockNumber")]
    block_number: Option<u64>,
    #[serde(rename = "transactionHash")]
    transaction_hash: Option<String>,
    #[serde(rename = "logIndex")]
    log_index: Option<u64>,
    timestamp: Option<u64>,
    pool: Option<String>,
    sender: Option<String>,
    owner: Option<String>,
    recipient: Option<String>,
    #[serde(rename = "tickLower")]
    tick_lower: Option<i32>,
    #[serde(rename = "tickUpper")]
    tick_upper: Option<i32>,
    tick: Option<i32>,
    liquidity: Option<String>,
    amount0: Option<String>,
    amount1: Option<String>,
    #[serde(rename = "sqrtPriceX96")]
    sqrt_price_x96: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransfersPage {
    #[serde(default)]
    transfers: Vec<ApiTransfer>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiTransfer {
    #[serde(rename = "fromAddress")]
    from_address: String,
    #[serde(rename = "toAddress")]
    to_address: String,
    #[serde(rename = "blockNumber")]
    block_number: Option<u64>,
    #[serde(rename = "transactionHash")]
    transaction_hash: Option<String>,
    #[serde(rename = "logIndex")]
    log_index: Option<u64>,
    timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BlockReply {
    #[serde(rename = "blockNumber")]
    block_number: Option<u64>,
    timestamp: Option<u64>,
}

fn parse_address(value: &str) -> Option<Address> {
    match value.parse::<Address>() {
        Ok(addr) => Some(addr),
        Err(_) => {
            warn!(target: "ledger::api", value, "Unparseable address in indexer payload");
            None
        }
    }
}

fn parse_h256(value: &str) -> Option<H256> {
    match value.parse::<H256>() {
        Ok(hash) => Some(hash),
        Err(_) => {
            warn!(target: "ledger::api", value, "Unparseable hash in indexer payload");
            None
        }
    }
}

/// Amounts come as decimal strings, occasionally 0x-prefixed hex.
fn parse_u256(value: &str) -> Option<U256> {
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        U256::from_str_radix(hex, 16).ok()
    } else {
        U256::from_dec_str(value).ok()
    };
    if parsed.is_none() {
        warn!(target: "ledger::api", value, "Unparseable amount in indexer payload");
    }
    parsed
}

fn truncate_body(body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        let mut end = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    } else {
        body
    }
}

pub struct IndexerApiSource {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    position_manager: Address,
    page_size: u32,
    transfer_cache: Cache<u64, Arc<Vec<RawTransfer>>>,
    rate_limiter: SourceRateLimiter,
}

impl IndexerApiSource {
    pub fn new(
        chain: &PerChainConfig,
        settings: Arc<UpstreamSettings>,
        rate_limiter: SourceRateLimiter,
    ) -> Result<Self, IndexerError> {
        let base_url = chain.indexer_api_url.clone().ok_or_else(|| {
            IndexerError::Config(format!(
                "Chain '{}' has no indexer_api_url but the indexer-api source was selected",
                chain.chain_name
            ))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.http_timeout_ms))
            .user_agent("position-ledger/0.3")
            .build()
            .map_err(|e| IndexerError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let transfer_cache = Cache::builder()
            .max_capacity(TRANSFER_CACHE_CAPACITY)
            .time_to_live(Duration::from_secs(TRANSFER_CACHE_TTL_SECS))
            .build();

        Ok(Self {
            name: format!("{}-api", chain.chain_name),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: chain.indexer_api_key.clone(),
            position_manager: chain.position_manager,
            page_size: settings.page_size,
            transfer_cache,
            rate_limiter,
        })
    }

    /// One GET under the limiter. Non-2xx responses surface as `Http` with a
    /// truncated body so 429/5xx stay retryable and 4xx fail fast.
    async fn get_json(&self, method_name: &str, url: String) -> Result<String, UpstreamError> {
        self.rate_limiter
            .execute(method_name, || {
                let client = self.client.clone();
                let url = url.clone();
                let api_key = self.api_key.clone();
                async move {
                    let mut request = client.get(&url);
                    if let Some(key) = api_key.as_deref() {
                        request = request.header("x-api-key", key);
                    }
                    let response = request.send().await?;
                    let status = response.status();
                    let body = response.text().await?;
                    if !status.is_success() {
                        return Err(UpstreamError::Http {
                            status: status.as_u16(),
                            body: truncate_body(body),
                        });
                    }
                    Ok(body)
                }
            })
            .await
    }

    fn events_url(&self, token_id: u64, from_block: u64, to_block: u64, page_token: Option<&str>) -> String {
        let mut url = format!(
            "{}/v1/positions/{:#x}/events?tokenId={}&fromBlock={}&toBlock={}&pageSize={}",
            self.base_url, self.position_manager, token_id, from_block, to_block, self.page_size
        );
        if let Some(token) = page_token {
            url.push_str("&pageToken=");
            url.push_str(token);
        }
        url
    }

    fn transfers_url(&self, token_id: u64, page_token: Option<&str>) -> String {
        let mut url = format!(
            "{}/v1/nft/{:#x}/transfers?tokenId={}&pageSize={}",
            self.base_url, self.position_manager, token_id, self.page_size
        );
        if let Some(token) = page_token {
            url.push_str("&pageToken=");
            url.push_str(token);
        }
        url
    }

    fn convert_event(record: ApiEvent, token_id: u64) -> RawPositionEvent {
        RawPositionEvent {
            token_id,
            event_name: record.event_name,
            block_number: record.block_number,
            tx_hash: record.transaction_hash.as_deref().and_then(parse_h256),
            log_index: record.log_index.unwrap_or(0),
            unix_ts: record.timestamp,
            pool: record.pool.as_deref().and_then(parse_address),
            sender: record.sender.as_deref().and_then(parse_address),
            owner: record.owner.as_deref().and_then(parse_address),
            recipient: record.recipient.as_deref().and_then(parse_address),
            tick_lower: record.tick_lower,
            tick_upper: record.tick_upper,
            tick: record.tick,
            liquidity: record.liquidity.as_deref().and_then(parse_u256),
            amount0: record.amount0.as_deref().and_then(parse_u256),
            amount1: record.amount1.as_deref().and_then(parse_u256),
            sqrt_price_x96: record.sqrt_price_x96.as_deref().and_then(parse_u256),
            metadata: None,
        }
    }

    fn convert_transfer(record: ApiTransfer, token_id: u64) -> Option<RawTransfer> {
        let from = parse_address(&record.from_address)?;
        let to = parse_address(&record.to_address)?;
        Some(RawTransfer {
            token_id,
            from,
            to,
            block_number: record.block_number,
            tx_hash: record.transaction_hash.as_deref().and_then(parse_h256),
            log_index: record.log_index,
            unix_ts: record.timestamp,
            metadata: None,
        })
    }

    /// Guards one pagination step: the cursor must change and the page count
    /// must stay bounded, otherwise the server is looping us.
    fn next_cursor(
        previous: Option<&str>,
        next: Option<String>,
        pages: usize,
    ) -> Result<Option<String>, UpstreamError> {
        match next {
            None => Ok(None),
            Some(token) if token.is_empty() => Ok(None),
            Some(token) => {
                if previous == Some(token.as_str()) {
                    return Err(UpstreamError::Pagination(format!(
                        "pageToken did not advance after page {}",
                        pages
                    )));
                }
                if pages >= MAX_PAGES {
                    return Err(UpstreamError::Pagination(format!(
                        "exceeded {} pages without exhausting the cursor",
                        MAX_PAGES
                    )));
                }
                Ok(Some(token))
            }
        }
    }

    async fn fetch_all_transfers(&self, token_id: u64) -> Result<Vec<RawTransfer>, UpstreamError> {
        let mut transfers = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let url = self.transfers_url(token_id, page_token.as_deref());
            let body = self.get_json("indexer_transfers", url).await?;
            let page: TransfersPage = serde_json::from_str(&body)?;
            pages += 1;

            transfers.extend(
                page.transfers
                    .into_iter()
                    .filter_map(|record| Self::convert_transfer(record, token_id)),
            );

            match Self::next_cursor(page_token.as_deref(), page.next_page_token, pages)? {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(
            target: "ledger::api",
            token_id,
            pages,
            transfers = transfers.len(),
            "Fetched transfer history from indexer"
        );
        Ok(transfers)
    }
}

#[async_trait]
impl UpstreamSource for IndexerApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn latest_block(&self) -> Result<u64, UpstreamError> {
        let url = format!("{}/v1/blocks/latest", self.base_url);
        let body = self.get_json("indexer_latest_block", url).await?;
        let reply: BlockReply = serde_json::from_str(&body)?;
        reply
            .block_number
            .ok_or_else(|| UpstreamError::Decode("latest block reply missing blockNumber".to_string()))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, UpstreamError> {
        let url = format!("{}/v1/blocks/{}", self.base_url, block_number);
        let body = self.get_json("indexer_block", url).await?;
        let reply: BlockReply = serde_json::from_str(&body)?;
        reply
            .timestamp
            .ok_or(UpstreamError::BlockNotFound(block_number))
    }

    async fn fetch_events(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawPositionEvent>, UpstreamError> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let url = self.events_url(token_id, from_block, to_block, page_token.as_deref());
            let body = self.get_json("indexer_events", url).await?;
            let page: EventsPage = serde_json::from_str(&body)?;
            pages += 1;

            events.extend(
                page.events
                    .into_iter()
                    .map(|record| Self::convert_event(record, token_id)),
            );

            match Self::next_cursor(page_token.as_deref(), page.next_page_token, pages)? {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(
            target: "ledger::api",
            token_id,
            from_block,
            to_block,
            pages,
            events = events.len(),
            "Fetched position events from indexer"
        );
        events.sort_by_key(|e| (e.block_number.unwrap_or(0), e.log_index));
        Ok(events)
    }

    async fn fetch_transfers(
        &self,
        token_id: u64,
        refresh: bool,
    ) -> Result<Vec<RawTransfer>, UpstreamError> {
        if !refresh {
            if let Some(cached) = self.transfer_cache.get(&token_id).await {
                debug!(target: "ledger::api", token_id, "Transfer cache hit");
                return Ok(cached.as_ref().clone());
            }
        }

        let mut transfers = self.fetch_all_transfers(token_id).await?;
        transfers.sort_by_key(|t| (t.block_number.unwrap_or(0), t.log_index.unwrap_or(0)));
        self.transfer_cache
            .insert(token_id, Arc::new(transfers.clone()))
            .await;
        Ok(transfers)
    }
}
