use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;

use position_ledger::errors::UpstreamError;
use position_ledger::types::{RawPositionEvent, RawTransfer};
use position_ledger::upstream::UpstreamSource;

// === Fake Upstream Source ===

/// Scriptable in-memory event source. Every knob is behind a lock so tests
/// can reconfigure it mid-run, and the fetch paths record enough call
/// history to assert on ranges, refresh flags, and concurrency.
pub struct FakeUpstream {
    latest_block: Arc<StdRwLock<u64>>,
    events: Arc<StdRwLock<HashMap<u64, Vec<RawPositionEvent>>>>,
    transfers: Arc<StdRwLock<HashMap<u64, Vec<RawTransfer>>>>,
    fail_events_for: Arc<StdRwLock<HashSet<u64>>>,
    fail_transfers_for: Arc<StdRwLock<HashSet<u64>>>,
    fetch_delay: Arc<StdRwLock<Option<Duration>>>,
    event_calls: Arc<StdRwLock<Vec<(u64, u64, u64)>>>,
    transfer_calls: Arc<StdRwLock<Vec<(u64, bool)>>>,
    latest_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeUpstream {
    pub fn new(latest_block: u64) -> Self {
        Self {
            latest_block: Arc::new(StdRwLock::new(latest_block)),
            events: Arc::new(StdRwLock::new(HashMap::new())),
            transfers: Arc::new(StdRwLock::new(HashMap::new())),
            fail_events_for: Arc::new(StdRwLock::new(HashSet::new())),
            fail_transfers_for: Arc::new(StdRwLock::new(HashSet::new())),
            fetch_delay: Arc::new(StdRwLock::new(None)),
            event_calls: Arc::new(StdRwLock::new(Vec::new())),
            transfer_calls: Arc::new(StdRwLock::new(Vec::new())),
            latest_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_latest_block(&self, block: u64) {
        *self.latest_block.write().unwrap() = block;
    }

    pub fn script_events(&self, token_id: u64, events: Vec<RawPositionEvent>) {
        self.events.write().unwrap().insert(token_id, events);
    }

    pub fn script_transfers(&self, token_id: u64, transfers: Vec<RawTransfer>) {
        self.transfers.write().unwrap().insert(token_id, transfers);
    }

    pub fn fail_events(&self, token_id: u64) {
        self.fail_events_for.write().unwrap().insert(token_id);
    }

    pub fn fail_transfers(&self, token_id: u64) {
        self.fail_transfers_for.write().unwrap().insert(token_id);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.write().unwrap() = Some(delay);
    }

    /// Every `(token_id, from_block, to_block)` passed to `fetch_events`,
    /// in call order.
    pub fn event_calls(&self) -> Vec<(u64, u64, u64)> {
        self.event_calls.read().unwrap().clone()
    }

    /// Every `(token_id, refresh)` passed to `fetch_transfers`.
    pub fn transfer_calls(&self) -> Vec<(u64, bool)> {
        self.transfer_calls.read().unwrap().clone()
    }

    pub fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently running fetches.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter_fetch(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
    }

    fn leave_fetch(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn maybe_delay(&self) {
        let delay = *self.fetch_delay.read().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl UpstreamSource for FakeUpstream {
    fn name(&self) -> &str {
        "fake"
    }

    async fn latest_block(&self) -> Result<u64, UpstreamError> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.latest_block.read().unwrap())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, UpstreamError> {
        Ok(1_600_000_000 + block_number * 2)
    }

    async fn fetch_events(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawPositionEvent>, UpstreamError> {
        self.event_calls
            .write()
            .unwrap()
            .push((token_id, from_block, to_block));
        self.enter_fetch();
        self.maybe_delay().await;

        let result = if self.fail_events_for.read().unwrap().contains(&token_id) {
            Err(UpstreamError::Rpc(format!(
                "scripted event failure for token {}",
                token_id
            )))
        } else {
            let map = self.events.read().unwrap();
            Ok(map
                .get(&token_id)
                .map(|events| {
                    events
                        .iter()
                        .filter(|e| match e.block_number {
                            Some(block) => block >= from_block && block <= to_block,
                            None => true,
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        };

        self.leave_fetch();
        result
    }

    async fn fetch_transfers(
        &self,
        token_id: u64,
        refresh: bool,
    ) -> Result<Vec<RawTransfer>, UpstreamError> {
        self.transfer_calls.write().unwrap().push((token_id, refresh));
        self.enter_fetch();
        self.maybe_delay().await;

        let result = if self.fail_transfers_for.read().unwrap().contains(&token_id) {
            Err(UpstreamError::Rpc(format!(
                "scripted transfer failure for token {}",
                token_id
            )))
        } else {
            let map = self.transfers.read().unwrap();
            Ok(map.get(&token_id).cloned().unwrap_or_default())
        };

        self.leave_fetch();
        result
    }
}
