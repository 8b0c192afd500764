//! Ledger writer: durable storage for normalized position events and
//! transfers.
//!
//! Writes are multi-row upserts keyed by the natural `tx_hash:log_index`
//! id, executed inside one transaction per call. Conflicts overwrite the
//! row wholesale; the normalizer is deterministic, so a conflicting write
//! always carries identical content and re-runs are no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::debug;

use crate::errors::StorageError;
use crate::metrics::UPSERT_ROWS_COUNTER;
use crate::types::{PositionEvent, PositionEventType, PositionTransfer};

/// Row counts surfaced by the status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCounts {
    pub events: u64,
    pub transfers: u64,
    pub distinct_tokens: u64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Upserts events in bulk. Returns the number of rows written or
    /// overwritten. The whole call commits atomically.
    async fn upsert_events(&self, events: &[PositionEvent]) -> Result<u64, StorageError>;

    /// Upserts transfers in bulk with the same semantics as events.
    async fn upsert_transfers(&self, transfers: &[PositionTransfer]) -> Result<u64, StorageError>;

    /// Reads back a token's events within an inclusive block range, ordered
    /// by `(block_number, log_index)`.
    async fn events_for_token(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PositionEvent>, StorageError>;

    /// Reads back a token's transfers within an inclusive block range.
    async fn transfers_for_token(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PositionTransfer>, StorageError>;

    /// Aggregate counts for status reporting.
    async fn counts(&self) -> Result<LedgerCounts, StorageError>;

    /// Deletes all ledger rows for the given tokens. Returns the number of
    /// rows removed across both tables.
    async fn delete_for_tokens(&self, token_ids: &[u64]) -> Result<u64, StorageError>;
}

//================================================================================================//
//                                     POSTGRES-BACKED STORE                                      //
//================================================================================================//

const EVENT_COLUMNS: usize = 21;
const TRANSFER_COLUMNS: usize = 9;

pub struct PostgresLedgerStore {
    pool: Arc<Pool>,
    /// Rows per statement; keeps each statement comfortably under the
    /// 65535 bind-parameter limit.
    chunk_size: usize,
}

/// Owned bind values for one event row. The borrow-based `ToSql` params
/// slice needs something stable to point at while the statement runs.
struct EventRow {
    id: String,
    token_id: i64,
    pool: Vec<u8>,
    block_number: i64,
    tx_hash: Vec<u8>,
    log_index: i64,
    unix_ts: i64,
    event_type: i16,
    sender: Option<Vec<u8>>,
    owner: Option<Vec<u8>>,
    recipient: Option<Vec<u8>>,
    tick_lower: Option<i32>,
    tick_upper: Option<i32>,
    tick: Option<i32>,
    liquidity_delta: Option<Decimal>,
    amount0: Option<Decimal>,
    amount1: Option<Decimal>,
    sqrt_price_x96: Option<Decimal>,
    price1_per_0: Option<f64>,
    usd_value: Option<f64>,
    metadata: Option<Value>,
}

impl From<&PositionEvent> for EventRow {
    fn from(event: &PositionEvent) -> Self {
        Self {
            id: event.id.clone(),
            token_id: event.token_id as i64,
            pool: event.pool.as_bytes().to_vec(),
            block_number: event.block_number as i64,
            tx_hash: event.tx_hash.as_bytes().to_vec(),
            log_index: event.log_index as i64,
            unix_ts: event.unix_ts as i64,
            event_type: event.event_type.as_i16(),
            sender: event.sender.map(|a| a.as_bytes().to_vec()),
            owner: event.owner.map(|a| a.as_bytes().to_vec()),
            recipient: event.recipient.map(|a| a.as_bytes().to_vec()),
            tick_lower: event.tick_lower,
            tick_upper: event.tick_upper,
            tick: event.tick,
            liquidity_delta: event.liquidity_delta,
            amount0: event.amount0,
            amount1: event.amount1,
            sqrt_price_x96: event.sqrt_price_x96,
            price1_per_0: event.price1_per_0,
            usd_value: event.usd_value,
            metadata: event.metadata.clone(),
        }
    }
}

struct TransferRow {
    id: String,
    token_id: i64,
    from: Vec<u8>,
    to: Vec<u8>,
    block_number: i64,
    tx_hash: Vec<u8>,
    log_index: i64,
    unix_ts: i64,
    metadata: Option<Value>,
}

impl From<&PositionTransfer> for TransferRow {
    fn from(transfer: &PositionTransfer) -> Self {
        Self {
            id: transfer.id.clone(),
            token_id: transfer.token_id as i64,
            from: transfer.from.as_bytes().to_vec(),
            to: transfer.to.as_bytes().to_vec(),
            block_number: transfer.block_number as i64,
            tx_hash: transfer.tx_hash.as_bytes().to_vec(),
            log_index: transfer.log_index as i64,
            unix_ts: transfer.unix_ts as i64,
            metadata: transfer.metadata.clone(),
        }
    }
}

/// Block numbers bind as BIGINT; a u64::MAX open-ended bound must clamp
/// instead of wrapping negative.
fn block_bound(block: u64) -> i64 {
    block.min(i64::MAX as u64) as i64
}

impl PostgresLedgerStore {
    pub fn new(pool: Arc<Pool>, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Builds `VALUES ($1, ...), ($n+1, ...)` placeholders for `rows` rows
    /// of `columns` columns each.
    fn values_clause(rows: usize, columns: usize) -> String {
        let mut clause = String::with_capacity(rows * columns * 5);
        for row in 0..rows {
            if row > 0 {
                clause.push_str(", ");
            }
            clause.push('(');
            for col in 0..columns {
                if col > 0 {
                    clause.push_str(", ");
                }
                clause.push('$');
                clause.push_str(&(row * columns + col + 1).to_string());
            }
            clause.push(')');
        }
        clause
    }

    fn event_upsert_sql(rows: usize) -> String {
        format!(
            "INSERT INTO position_events (\
                event_id, token_id, pool_address, block_number, transaction_hash, log_index, \
                unix_ts, event_type, sender, owner, recipient, \
                tick_lower, tick_upper, tick, \
                liquidity_delta, amount0, amount1, sqrt_price_x96, \
                price1_per_0, usd_value, metadata\
            ) VALUES {} \
            ON CONFLICT (event_id) DO UPDATE SET \
                token_id = EXCLUDED.token_id, \
                pool_address = EXCLUDED.pool_address, \
                block_number = EXCLUDED.block_number, \
                transaction_hash = EXCLUDED.transaction_hash, \
                log_index = EXCLUDED.log_index, \
                unix_ts = EXCLUDED.unix_ts, \
                event_type = EXCLUDED.event_type, \
                sender = EXCLUDED.sender, \
                owner = EXCLUDED.owner, \
                recipient = EXCLUDED.recipient, \
                tick_lower = EXCLUDED.tick_lower, \
                tick_upper = EXCLUDED.tick_upper, \
                tick = EXCLUDED.tick, \
                liquidity_delta = EXCLUDED.liquidity_delta, \
                amount0 = EXCLUDED.amount0, \
                amount1 = EXCLUDED.amount1, \
                sqrt_price_x96 = EXCLUDED.sqrt_price_x96, \
                price1_per_0 = EXCLUDED.price1_per_0, \
                usd_value = EXCLUDED.usd_value, \
                metadata = EXCLUDED.metadata",
            Self::values_clause(rows, EVENT_COLUMNS)
        )
    }

    fn transfer_upsert_sql(rows: usize) -> String {
        format!(
            "INSERT INTO position_transfers (\
                transfer_id, token_id, from_address, to_address, block_number, \
                transaction_hash, log_index, unix_ts, metadata\
            ) VALUES {} \
            ON CONFLICT (transfer_id) DO UPDATE SET \
                token_id = EXCLUDED.token_id, \
                from_address = EXCLUDED.from_address, \
                to_address = EXCLUDED.to_address, \
                block_number = EXCLUDED.block_number, \
                transaction_hash = EXCLUDED.transaction_hash, \
                log_index = EXCLUDED.log_index, \
                unix_ts = EXCLUDED.unix_ts, \
                metadata = EXCLUDED.metadata",
            Self::values_clause(rows, TRANSFER_COLUMNS)
        )
    }

    fn row_to_event(row: &Row) -> Result<PositionEvent, StorageError> {
        let pool_bytes: Vec<u8> = row.try_get("pool_address")?;
        let tx_bytes: Vec<u8> = row.try_get("transaction_hash")?;
        if pool_bytes.len() != 20 || tx_bytes.len() != 32 {
            return Err(StorageError::Serialization(
                "Unexpected byte length for address or hash column".to_string(),
            ));
        }
        let event_type = PositionEventType::try_from(row.try_get::<_, i16>("event_type")?)
            .map_err(StorageError::Serialization)?;
        Ok(PositionEvent {
            id: row.try_get("event_id")?,
            token_id: row.try_get::<_, i64>("token_id")? as u64,
            pool: Address::from_slice(&pool_bytes),
            block_number: row.try_get::<_, i64>("block_number")? as u64,
            tx_hash: H256::from_slice(&tx_bytes),
            log_index: row.try_get::<_, i64>("log_index")? as u64,
            unix_ts: row.try_get::<_, i64>("unix_ts")? as u64,
            event_type,
            sender: bytes_to_address(row.try_get("sender")?)?,
            owner: bytes_to_address(row.try_get("owner")?)?,
            recipient: bytes_to_address(row.try_get("recipient")?)?,
            tick_lower: row.try_get("tick_lower")?,
            tick_upper: row.try_get("tick_upper")?,
            tick: row.try_get("tick")?,
            liquidity_delta: row.try_get("liquidity_delta")?,
            amount0: row.try_get("amount0")?,
            amount1: row.try_get("amount1")?,
            sqrt_price_x96: row.try_get("sqrt_price_x96")?,
            price1_per_0: row.try_get("price1_per_0")?,
            usd_value: row.try_get("usd_value")?,
            metadata: row.try_get("metadata")?,
        })
    }

    fn row_to_transfer(row: &Row) -> Result<PositionTransfer, StorageError> {
        let from_bytes: Vec<u8> = row.try_get("from_address")?;
        let to_bytes: Vec<u8> = row.try_get("to_address")?;
        let tx_bytes: Vec<u8> = row.try_get("transaction_hash")?;
        if from_bytes.len() != 20 || to_bytes.len() != 20 || tx_bytes.len() != 32 {
            return Err(StorageError::Serialization(
                "Unexpected byte length for address or hash column".to_string(),
            ));
        }
        Ok(PositionTransfer {
            id: row.try_get("transfer_id")?,
            token_id: row.try_get::<_, i64>("token_id")? as u64,
            from: Address::from_slice(&from_bytes),
            to: Address::from_slice(&to_bytes),
            block_number: row.try_get::<_, i64>("block_number")? as u64,
            tx_hash: H256::from_slice(&tx_bytes),
            log_index: row.try_get::<_, i64>("log_index")? as u64,
            unix_ts: row.try_get::<_, i64>("unix_ts")? as u64,
            metadata: row.try_get("metadata")?,
        })
    }
}

fn bytes_to_address(bytes: Option<Vec<u8>>) -> Result<Option<Address>, StorageError> {
    match bytes {
        None => Ok(None),
        Some(b) if b.len() == 20 => Ok(Some(Address::from_slice(&b))),
        Some(b) => Err(StorageError::Serialization(format!(
            "Expected 20-byte address, got {} bytes",
            b.len()
        ))),
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn upsert_events(&self, events: &[PositionEvent]) -> Result<u64, StorageError> {
        if events.is_empty() {
            return Ok(0);
        }

        let rows: Vec<EventRow> = events.iter().map(EventRow::from).collect();
        let mut client = self.pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let mut written = 0u64;
        for chunk in rows.chunks(self.chunk_size) {
            let sql = Self::event_upsert_sql(chunk.len());
            let mut params: Vec<&(dyn ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * EVENT_COLUMNS);
            for row in chunk {
                params.push(&row.id);
                params.push(&row.token_id);
                params.push(&row.pool);
                params.push(&row.block_number);
                params.push(&row.tx_hash);
                params.push(&row.log_index);
                params.push(&row.unix_ts);
                params.push(&row.event_type);
                params.push(&row.sender);
                params.push(&row.owner);
                params.push(&row.recipient);
                params.push(&row.tick_lower);
                params.push(&row.tick_upper);
                params.push(&row.tick);
                params.push(&row.liquidity_delta);
                params.push(&row.amount0);
                params.push(&row.amount1);
                params.push(&row.sqrt_price_x96);
                params.push(&row.price1_per_0);
                params.push(&row.usd_value);
                params.push(&row.metadata);
            }
            written += tx.execute(&sql, &params).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        UPSERT_ROWS_COUNTER.inc_by(written);
        debug!(target: "ledger::db", rows = written, "Upserted position events");
        Ok(written)
    }

    async fn upsert_transfers(&self, transfers: &[PositionTransfer]) -> Result<u64, StorageError> {
        if transfers.is_empty() {
            return Ok(0);
        }

        let rows: Vec<TransferRow> = transfers.iter().map(TransferRow::from).collect();
        let mut client = self.pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let mut written = 0u64;
        for chunk in rows.chunks(self.chunk_size) {
            let sql = Self::transfer_upsert_sql(chunk.len());
            let mut params: Vec<&(dyn ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * TRANSFER_COLUMNS);
            for row in chunk {
                params.push(&row.id);
                params.push(&row.token_id);
                params.push(&row.from);
                params.push(&row.to);
                params.push(&row.block_number);
                params.push(&row.tx_hash);
                params.push(&row.log_index);
                params.push(&row.unix_ts);
                params.push(&row.metadata);
            }
            written += tx.execute(&sql, &params).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        UPSERT_ROWS_COUNTER.inc_by(written);
        debug!(target: "ledger::db", rows = written, "Upserted position transfers");
        Ok(written)
    }

    async fn events_for_token(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PositionEvent>, StorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT event_id, token_id, pool_address, block_number, transaction_hash, \
                        log_index, unix_ts, event_type, sender, owner, recipient, \
                        tick_lower, tick_upper, tick, liquidity_delta, amount0, amount1, \
                        sqrt_price_x96, price1_per_0, usd_value, metadata \
                 FROM position_events \
                 WHERE token_id = $1 AND block_number BETWEEN $2 AND $3 \
                 ORDER BY block_number, log_index",
                &[&(token_id as i64), &block_bound(from_block), &block_bound(to_block)],
            )
            .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn transfers_for_token(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PositionTransfer>, StorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT transfer_id, token_id, from_address, to_address, block_number, \
                        transaction_hash, log_index, unix_ts, metadata \
                 FROM position_transfers \
                 WHERE token_id = $1 AND block_number BETWEEN $2 AND $3 \
                 ORDER BY block_number, log_index",
                &[&(token_id as i64), &block_bound(from_block), &block_bound(to_block)],
            )
            .await?;
        rows.iter().map(Self::row_to_transfer).collect()
    }

    async fn counts(&self) -> Result<LedgerCounts, StorageError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT \
                    (SELECT COUNT(*) FROM position_events) AS events, \
                    (SELECT COUNT(*) FROM position_transfers) AS transfers, \
                    (SELECT COUNT(DISTINCT token_id) FROM position_events) AS distinct_tokens",
                &[],
            )
            .await?;
        Ok(LedgerCounts {
            events: row.try_get::<_, i64>("events")? as u64,
            transfers: row.try_get::<_, i64>("transfers")? as u64,
            distinct_tokens: row.try_get::<_, i64>("distinct_tokens")? as u64,
        })
    }

    async fn delete_for_tokens(&self, token_ids: &[u64]) -> Result<u64, StorageError> {
        if token_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = token_ids.iter().map(|id| *id as i64).collect();
        let mut client = self.pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        let events = tx
            .execute("DELETE FROM position_events WHERE token_id = ANY($1)", &[&ids])
            .await?;
        let transfers = tx
            .execute("DELETE FROM position_transfers WHERE token_id = ANY($1)", &[&ids])
            .await?;
        tx.commit()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(events + transfers)
    }
}

//================================================================================================//
//                                      IN-MEMORY STORE                                           //
//================================================================================================//

/// HashMap-backed ledger with the same upsert semantics as Postgres. Used
/// by the test suites; keyed by the same natural ids.
#[derive(Default)]
pub struct MemoryLedgerStore {
    events: std::sync::RwLock<HashMap<String, PositionEvent>>,
    transfers: std::sync::RwLock<HashMap<String, PositionTransfer>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn upsert_events(&self, events: &[PositionEvent]) -> Result<u64, StorageError> {
        let mut map = self
            .events
            .write()
            .map_err(|_| StorageError::Pool("ledger lock poisoned".to_string()))?;
        for event in events {
            map.insert(event.id.clone(), event.clone());
        }
        Ok(events.len() as u64)
    }

    async fn upsert_transfers(&self, transfers: &[PositionTransfer]) -> Result<u64, StorageError> {
        let mut map = self
            .transfers
            .write()
            .map_err(|_| StorageError::Pool("ledger lock poisoned".to_string()))?;
        for transfer in transfers {
            map.insert(transfer.id.clone(), transfer.clone());
        }
        Ok(transfers.len() as u64)
    }

    async fn events_for_token(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PositionEvent>, StorageError> {
        let map = self
            .events
            .read()
            .map_err(|_| StorageError::Pool("ledger lock poisoned".to_string()))?;
        let mut events: Vec<PositionEvent> = map
            .values()
            .filter(|e| {
                e.token_id == token_id && e.block_number >= from_block && e.block_number <= to_block
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn transfers_for_token(
        &self,
        token_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PositionTransfer>, StorageError> {
        let map = self
            .transfers
            .read()
            .map_err(|_| StorageError::Pool("ledger lock poisoned".to_string()))?;
        let mut transfers: Vec<PositionTransfer> = map
            .values()
            .filter(|t| {
                t.token_id == token_id && t.block_number >= from_block && t.block_number <= to_block
            })
            .cloned()
            .collect();
        transfers.sort_by_key(|t| (t.block_number, t.log_index));
        Ok(transfers)
    }

    async fn counts(&self) -> Result<LedgerCounts, StorageError> {
        let events = self
            .events
            .read()
            .map_err(|_| StorageError::Pool("ledger lock poisoned".to_string()))?;
        let transfers = self
            .transfers
            .read()
            .map_err(|_| StorageError::Pool("ledger lock poisoned".to_string()))?;
        let distinct: std::collections::HashSet<u64> =
            events.values().map(|e| e.token_id).collect();
        Ok(LedgerCounts {
            events: events.len() as u64,
            transfers: transfers.len() as u64,
            distinct_tokens: distinct.len() as u64,
        })
    }

    async fn delete_for_tokens(&self, token_ids: &[u64]) -> Result<u64, StorageError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| StorageError::Pool("ledger lock poisoned".to_string()))?;
        let mut transfers = self
            .transfers
            .write()
            .map_err(|_| StorageError::Pool("ledger lock poisoned".to_string()))?;
        let before = events.len() + transfers.len();
        events.retain(|_, e| !token_ids.contains(&e.token_id));
        transfers.retain(|_, t| !token_ids.contains(&t.token_id));
        Ok((before - events.len() - transfers.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ledger_id;

    fn sample_event(token_id: u64, block: u64, log_index: u64) -> PositionEvent {
        let tx_hash = H256::from_low_u64_be(block * 1000 + log_index);
        PositionEvent {
            id: ledger_id(&tx_hash, log_index),
            token_id,
            pool: Address::repeat_byte(0xaa),
            block_number: block,
            tx_hash,
            log_index,
            unix_ts: 1_700_000_000 + block,
            event_type: PositionEventType::Increase,
            sender: Some(Address::repeat_byte(0x01)),
            owner: None,
            recipient: None,
            tick_lower: Some(-100),
            tick_upper: Some(100),
            tick: None,
            liquidity_delta: Some(Decimal::from(500)),
            amount0: Some(Decimal::from(1_000)),
            amount1: Some(Decimal::from(2_000)),
            sqrt_price_x96: None,
            price1_per_0: Some(2.0),
            usd_value: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryLedgerStore::new();
        let events = vec![sample_event(1, 100, 0), sample_event(1, 100, 1)];

        store.upsert_events(&events).await.unwrap();
        store.upsert_events(&events).await.unwrap();

        let stored = store.events_for_token(1, 0, 200).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored, store.events_for_token(1, 0, 200).await.unwrap());
    }

    #[tokio::test]
    async fn range_query_is_inclusive_and_ordered() {
        let store = MemoryLedgerStore::new();
        let events = vec![
            sample_event(1, 200, 3),
            sample_event(1, 100, 1),
            sample_event(1, 100, 0),
            sample_event(1, 300, 0),
        ];
        store.upsert_events(&events).await.unwrap();

        let stored = store.events_for_token(1, 100, 200).await.unwrap();
        let keys: Vec<(u64, u64)> = stored.iter().map(|e| (e.block_number, e.log_index)).collect();
        assert_eq!(keys, vec![(100, 0), (100, 1), (200, 3)]);
    }

    #[tokio::test]
    async fn delete_removes_only_requested_tokens() {
        let store = MemoryLedgerStore::new();
        store
            .upsert_events(&[sample_event(1, 100, 0), sample_event(2, 100, 1)])
            .await
            .unwrap();

        let removed = store.delete_for_tokens(&[1]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.events_for_token(1, 0, 1000).await.unwrap().is_empty());
        assert_eq!(store.events_for_token(2, 0, 1000).await.unwrap().len(), 1);
    }

    #[test]
    fn values_clause_numbers_placeholders_sequentially() {
        let clause = PostgresLedgerStore::values_clause(2, 3);
        assert_eq!(clause, "($1, $2, $3), ($4, $5, $6)");
    }

    #[test]
    fn event_upsert_sql_covers_every_column() {
        let sql = PostgresLedgerStore::event_upsert_sql(1);
        assert!(sql.contains("ON CONFLICT (event_id) DO UPDATE SET"));
        assert!(sql.contains(&format!("${}", EVENT_COLUMNS)));
        assert!(!sql.contains(&format!("${}", EVENT_COLUMNS + 1)));
        assert_eq!(sql.matches("EXCLUDED.").count(), EVENT_COLUMNS - 1);
    }
}
