//! Backfill orchestration.
//!
//! Drives the per-token sync cycle: resolve the block range from the
//! checkpoint (or the deployment block), pull raw transfers and events from
//! the upstream source, normalize, upsert, read the durable rows back, then
//! advance the checkpoint. Tokens are processed by a fixed pool of worker
//! lanes pulling off a shared queue, so a batch of fifty tokens never opens
//! fifty concurrent upstream scans. One token's failure is recorded and
//! isolated; the rest of the batch proceeds.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{BackfillSettings, PerChainConfig};
use crate::errors::IndexerError;
use crate::ledger::LedgerStore;
use crate::metrics::{
    BACKFILL_DURATION_MS, CHECKPOINT_ADVANCES, EVENTS_WRITTEN, TOKENS_FAILED, TOKENS_SYNCED,
    TRANSFERS_WRITTEN,
};
use crate::normalizer::EventNormalizer;
use crate::types::{
    BackfillMode, BackfillRequest, BackfillSummary, Checkpoint, TokenBackfillResult,
    TokenSyncStage,
};
use crate::upstream::UpstreamSource;

/// Range and mode shared by every token in one batch. `to_block` is pinned
/// once at batch start so all tokens advance to the same upper bound.
#[derive(Debug, Clone, Copy)]
struct BatchPlan {
    mode: BackfillMode,
    since_block: Option<u64>,
    to_block: u64,
    refresh_transfers: bool,
}

/// Rows removed by an admin clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOutcome {
    pub ledger_rows_deleted: u64,
    pub checkpoints_cleared: u64,
}

pub struct BackfillOrchestrator {
    source: Arc<dyn UpstreamSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    ledger: Arc<dyn LedgerStore>,
    normalizer: Arc<EventNormalizer>,
    settings: BackfillSettings,
    chain_name: String,
    genesis_block: u64,
    cancellation: CancellationToken,
}

impl BackfillOrchestrator {
    pub fn new(
        source: Arc<dyn UpstreamSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        ledger: Arc<dyn LedgerStore>,
        normalizer: Arc<EventNormalizer>,
        settings: BackfillSettings,
        chain: &PerChainConfig,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            source,
            checkpoints,
            ledger,
            normalizer,
            settings,
            chain_name: chain.chain_name.clone(),
            genesis_block: chain.genesis_block,
            cancellation,
        }
    }

    fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settings.staleness_window_secs as i64)
    }

    /// Cheap eligibility check for background syncing: true when the token
    /// has never been synced or its checkpoint fell out of the freshness
    /// window. Checkpoint lookup only, no upstream calls.
    pub async fn needs_sync(&self, token_id: u64) -> Result<bool, IndexerError> {
        let checkpoint = self.checkpoints.load(self.source.name(), token_id).await?;
        Ok(match checkpoint {
            None => true,
            Some(cp) => !cp.is_fresh(self.staleness_window(), Utc::now()),
        })
    }

    /// Runs one backfill batch to completion and reports per-token results.
    ///
    /// Batch-level failures (no chain head reachable, storage missing) abort
    /// before any token is attempted and surface as `Err`. Everything after
    /// that point is per-token: a failed token is recorded in the summary
    /// with its checkpoint untouched, and its lane moves on.
    pub async fn backfill_positions(
        self: Arc<Self>,
        request: BackfillRequest,
    ) -> Result<BackfillSummary, IndexerError> {
        let started = Instant::now();

        let mut seen = HashSet::new();
        let token_ids: Vec<u64> = request
            .token_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        if token_ids.is_empty() {
            info!(target: "ledger::backfill", "No tokens requested, nothing to do");
            return Ok(BackfillSummary::from_results(Vec::new(), 0));
        }

        let to_block = match request.to_block {
            Some(block) => block,
            None => self.source.latest_block().await?,
        };
        let plan = BatchPlan {
            mode: request.mode,
            since_block: request.since_block,
            to_block,
            refresh_transfers: request.mode == BackfillMode::Full,
        };
        let concurrency = request
            .concurrency
            .unwrap_or(self.settings.concurrency)
            .max(1)
            .min(token_ids.len());

        info!(
            target: "ledger::backfill",
            chain = %self.chain_name,
            source = self.source.name(),
            mode = %plan.mode,
            tokens = token_ids.len(),
            to_block,
            concurrency,
            "Starting backfill batch"
        );

        let (queue_tx, queue_rx) = mpsc::channel(token_ids.len());
        for &token_id in &token_ids {
            if queue_tx.send(token_id).await.is_err() {
                return Err(IndexerError::Channel("token queue closed during fill".to_string()));
            }
        }
        drop(queue_tx);

        let queue = Arc::new(Mutex::new(queue_rx));
        let results = Arc::new(Mutex::new(Vec::with_capacity(token_ids.len())));

        let mut handles = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let orchestrator = self.clone();
            let queue = queue.clone();
            let results = results.clone();
            handles.push(tokio::spawn(async move {
                BackfillOrchestrator::worker_loop(orchestrator, worker_id, plan, queue, results)
                    .await;
            }));
        }
        for handle in handles {
            handle.await?;
        }

        // Tokens still queued after the workers exit were never started
        // (cancellation); they count as failed so the summary stays honest.
        {
            let mut receiver = queue.lock().await;
            let mut results = results.lock().await;
            while let Ok(token_id) = receiver.try_recv() {
                results.push(TokenBackfillResult {
                    token_id,
                    stage: TokenSyncStage::Pending,
                    from_block: 0,
                    to_block: plan.to_block,
                    events_written: 0,
                    transfers_written: 0,
                    elapsed_ms: 0,
                    error: Some("batch cancelled before this token started".to_string()),
                });
            }
        }

        let mut results = {
            let mut guard = results.lock().await;
            std::mem::take(&mut *guard)
        };
        results.sort_by_key(|r| r.token_id);

        let total_elapsed_ms = started.elapsed().as_millis() as u64;
        BACKFILL_DURATION_MS
            .with_label_values(&[&self.chain_name, &plan.mode.to_string()])
            .observe(total_elapsed_ms as f64);

        let summary = BackfillSummary::from_results(results, total_elapsed_ms);
        info!(
            target: "ledger::backfill",
            chain = %self.chain_name,
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            elapsed_ms = summary.total_elapsed_ms,
            "Backfill batch finished"
        );
        Ok(summary)
    }

    async fn worker_loop(
        orchestrator: Arc<BackfillOrchestrator>,
        worker_id: usize,
        plan: BatchPlan,
        queue: Arc<Mutex<mpsc::Receiver<u64>>>,
        results: Arc<Mutex<Vec<TokenBackfillResult>>>,
    ) {
        loop {
            let token_id = tokio::select! {
                biased;
                _ = orchestrator.cancellation.cancelled() => {
                    debug!(target: "ledger::backfill", worker_id, "Worker stopping on cancellation");
                    break;
                }
                next = async { queue.lock().await.recv().await } => match next {
                    Some(token_id) => token_id,
                    None => break,
                },
            };

            let result = orchestrator.sync_token(token_id, &plan).await;
            results.lock().await.push(result);
        }
    }

    /// One token's full cycle. Never returns an error: failures become a
    /// `TokenBackfillResult` carrying the stage that broke.
    async fn sync_token(&self, token_id: u64, plan: &BatchPlan) -> TokenBackfillResult {
        let started = Instant::now();
        let mut stage = TokenSyncStage::Pending;
        let mut from_block = self.genesis_block;

        let outcome = self
            .run_token_cycle(token_id, plan, &mut stage, &mut from_block)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((events_written, transfers_written)) => {
                EVENTS_WRITTEN
                    .with_label_values(&[&self.chain_name])
                    .inc_by(events_written as u64);
                TRANSFERS_WRITTEN
                    .with_label_values(&[&self.chain_name])
                    .inc_by(transfers_written as u64);
                TOKENS_SYNCED
                    .with_label_values(&[&self.chain_name, &plan.mode.to_string()])
                    .inc();
                info!(
                    target: "ledger::backfill",
                    token_id,
                    from_block,
                    to_block = plan.to_block,
                    events_written,
                    transfers_written,
                    elapsed_ms,
                    "Token synced"
                );
                TokenBackfillResult {
                    token_id,
                    stage: TokenSyncStage::Done,
                    from_block,
                    to_block: plan.to_block,
                    events_written,
                    transfers_written,
                    elapsed_ms,
                    error: None,
                }
            }
            Err(e) => {
                TOKENS_FAILED
                    .with_label_values(&[&self.chain_name, &stage.to_string()])
                    .inc();
                warn!(
                    target: "ledger::backfill",
                    token_id,
                    stage = %stage,
                    elapsed_ms,
                    error = %e,
                    "Token sync failed, checkpoint untouched"
                );
                TokenBackfillResult {
                    token_id,
                    stage: TokenSyncStage::Failed,
                    from_block,
                    to_block: plan.to_block,
                    events_written: 0,
                    transfers_written: 0,
                    elapsed_ms,
                    error: Some(format!("{}: {}", stage, e)),
                }
            }
        }
    }

    async fn run_token_cycle(
        &self,
        token_id: u64,
        plan: &BatchPlan,
        stage: &mut TokenSyncStage,
        from_block: &mut u64,
    ) -> Result<(usize, usize), IndexerError> {
        *from_block = self.resolve_from_block(token_id, plan).await?;

        *stage = TokenSyncStage::FetchingTransfers;
        self.ensure_active()?;
        let raw_transfers = self
            .source
            .fetch_transfers(token_id, plan.refresh_transfers)
            .await?;

        *stage = TokenSyncStage::FetchingEvents;
        self.ensure_active()?;
        let raw_events = self
            .source
            .fetch_events(token_id, *from_block, plan.to_block)
            .await?;

        *stage = TokenSyncStage::Normalizing;
        let events = self.normalizer.normalize_events(self.source.as_ref(), &raw_events).await?;
        let transfers = self
            .normalizer
            .normalize_transfers(self.source.as_ref(), &raw_transfers)
            .await?;

        *stage = TokenSyncStage::Writing;
        self.ensure_active()?;
        self.ledger.upsert_events(&events).await?;
        self.ledger.upsert_transfers(&transfers).await?;

        // Report what is durably visible, not what we think we wrote.
        let stored_events = self
            .ledger
            .events_for_token(token_id, *from_block, plan.to_block)
            .await?;
        let stored_transfers = self.ledger.transfers_for_token(token_id, 0, u64::MAX).await?;

        *stage = TokenSyncStage::CheckpointAdvance;
        self.checkpoints
            .advance(Checkpoint::new(self.source.name(), token_id, plan.to_block))
            .await?;
        CHECKPOINT_ADVANCES
            .with_label_values(&[self.source.name()])
            .inc();

        *stage = TokenSyncStage::Done;
        Ok((stored_events.len(), stored_transfers.len()))
    }

    /// Lower bound for the event scan. The deployment block is the floor in
    /// every mode; a checkpoint's last block is re-covered rather than
    /// skipped past, which the idempotent writer makes safe.
    async fn resolve_from_block(&self, token_id: u64, plan: &BatchPlan) -> Result<u64, IndexerError> {
        match plan.mode {
            BackfillMode::Full => Ok(self.genesis_block),
            BackfillMode::Since => {
                if let Some(block) = plan.since_block {
                    return Ok(block.max(self.genesis_block));
                }
                let checkpoint = self.checkpoints.load(self.source.name(), token_id).await?;
                Ok(checkpoint
                    .map(|cp| cp.last_block.max(self.genesis_block))
                    .unwrap_or(self.genesis_block))
            }
        }
    }

    fn ensure_active(&self) -> Result<(), IndexerError> {
        if self.cancellation.is_cancelled() {
            Err(IndexerError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Admin cache clear: drops a token set's ledger rows and checkpoints.
    /// With its checkpoint gone, the next `since` sync of a cleared token
    /// implicitly runs full from the deployment block.
    pub async fn clear(&self, token_ids: &[u64]) -> Result<ClearOutcome, IndexerError> {
        let ledger_rows_deleted = self.ledger.delete_for_tokens(token_ids).await?;
        let checkpoints_cleared = self.checkpoints.clear(self.source.name(), token_ids).await?;
        info!(
            target: "ledger::backfill",
            chain = %self.chain_name,
            tokens = token_ids.len(),
            ledger_rows_deleted,
            checkpoints_cleared,
            "Cleared position data"
        );
        Ok(ClearOutcome {
            ledger_rows_deleted,
            checkpoints_cleared,
        })
    }

    /// Fire-and-forget staleness sweep: filters the given tokens down to
    /// those needing a sync and runs a `since` batch for them in the
    /// background. The caller gets the handle back immediately and is free
    /// to drop it.
    pub fn spawn_auto_sync(self: Arc<Self>, token_ids: Vec<u64>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stale = Vec::new();
            for token_id in token_ids {
                match self.needs_sync(token_id).await {
                    Ok(true) => stale.push(token_id),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            target: "ledger::backfill",
                            token_id,
                            error = %e,
                            "Staleness check failed, skipping token"
                        );
                    }
                }
            }
            if stale.is_empty() {
                debug!(target: "ledger::backfill", "All checkpoints fresh, nothing to sync");
                return;
            }

            info!(
                target: "ledger::backfill",
                tokens = stale.len(),
                "Auto-sync dispatching stale tokens"
            );
            let request = BackfillRequest::new(stale, BackfillMode::Since);
            match self.clone().backfill_positions(request).await {
                Ok(summary) => {
                    info!(
                        target: "ledger::backfill",
                        successful = summary.successful,
                        failed = summary.failed,
                        elapsed_ms = summary.total_elapsed_ms,
                        "Auto-sync finished"
                    );
                }
                Err(e) => {
                    error!(target: "ledger::backfill", error = %e, "Auto-sync batch failed");
                }
            }
        })
    }

    /// Periodic staleness sweep over a fixed token set, one sweep at a time,
    /// until the cancellation token fires.
    pub fn spawn_periodic_sync(self: Arc<Self>, token_ids: Vec<u64>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.settings.auto_sync_interval_secs.max(1));
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancellation.cancelled() => {
                        info!(target: "ledger::backfill", "Periodic sync stopping on cancellation");
                        break;
                    }
                    _ = interval.tick() => {
                        let sweep = self.clone().spawn_auto_sync(token_ids.clone());
                        if let Err(e) = sweep.await {
                            error!(target: "ledger::backfill", error = %e, "Auto-sync task panicked");
                        }
                    }
                }
            }
        })
    }
}
