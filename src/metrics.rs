//! # Global Metrics Registry
//!
//! This module defines and registers all Prometheus metrics for the indexer.
//! By centralizing metric definitions, we ensure consistency and provide a
//! single point of reference for the observability surface.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

pub static EVENTS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_events_written_total",
        "Position events upserted into the ledger.",
        &["chain"]
    )
    .expect("Failed to register ledger_events_written_total")
});

pub static TRANSFERS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_transfers_written_total",
        "Position transfers upserted into the ledger.",
        &["chain"]
    )
    .expect("Failed to register ledger_transfers_written_total")
});

pub static TOKENS_SYNCED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_tokens_synced_total",
        "Tokens whose backfill completed through checkpoint advance.",
        &["chain", "mode"]
    )
    .expect("Failed to register ledger_tokens_synced_total")
});

pub static TOKENS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_tokens_failed_total",
        "Tokens whose backfill failed at some stage.",
        &["chain", "stage"]
    )
    .expect("Failed to register ledger_tokens_failed_total")
});

pub static CHECKPOINT_ADVANCES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_checkpoint_advances_total",
        "Checkpoint writes that moved a token's cursor forward.",
        &["source"]
    )
    .expect("Failed to register ledger_checkpoint_advances_total")
});

pub static UPSERT_ROWS_COUNTER: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ledger_upsert_rows_total",
        "Rows sent through the multi-row upsert path."
    )
    .expect("Failed to register ledger_upsert_rows_total")
});

pub static BACKFILL_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_backfill_duration_ms",
        "Wall-clock duration of a whole backfill batch in milliseconds.",
        &["chain", "mode"],
        vec![50.0, 250.0, 1000.0, 5000.0, 15000.0, 60000.0, 300000.0]
    )
    .expect("Failed to register ledger_backfill_duration_ms")
});

pub static RPC_LATENCY_HISTOGRAM: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "rpc_call_latency_seconds",
        "Upstream call latency in seconds, labeled by method.",
        &["method"]
    )
    .expect("Failed to register rpc_call_latency_seconds")
});

pub static RPC_RETRIES_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rpc_call_retries_total",
        "Upstream call retries, labeled by method.",
        &["method"]
    )
    .expect("Failed to register rpc_call_retries_total")
});

pub static RPC_TIMEOUTS_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rpc_call_timeouts_total",
        "Upstream calls that hit the per-call deadline, labeled by method.",
        &["method"]
    )
    .expect("Failed to register rpc_call_timeouts_total")
});

/// Renders every registered metric in the Prometheus text format. The CLI
/// prints this on demand instead of running an HTTP exporter.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_render() {
        EVENTS_WRITTEN.with_label_values(&["flare"]).inc_by(3);
        RPC_RETRIES_COUNTER.with_label_values(&["eth_getLogs"]).inc();
        let rendered = gather_metrics();
        assert!(rendered.contains("ledger_events_written_total"));
        assert!(rendered.contains("rpc_call_retries_total"));
    }
}
