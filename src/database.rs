//! Shared database connection pool management
//!
//! This module builds the deadpool_postgres pool from a DATABASE_URL-style
//! connection string and owns the ledger schema bootstrap. All stores in
//! this crate borrow the same pool to prevent connection exhaustion.

use deadpool_postgres::{Config as PgConfig, Pool, PoolConfig, Runtime, Timeouts};
use std::sync::Arc;
use tokio_postgres::NoTls;
use tracing::info;

use crate::errors::StorageError;

const DEFAULT_POOL_SIZE: usize = 20;

/// Creates a connection pool from a postgres:// URL. Fails fast: a
/// connection is checked out once before the pool is handed back.
pub async fn create_database_pool(database_url: &str) -> Result<Arc<Pool>, StorageError> {
    let mut pg_config = PgConfig::new();

    let url = url::Url::parse(database_url)
        .map_err(|e| StorageError::Pool(format!("Invalid DATABASE_URL format: {}", e)))?;

    if url.scheme() != "postgres" && url.scheme() != "postgresql" {
        return Err(StorageError::Pool(format!(
            "Invalid database scheme: expected 'postgres' or 'postgresql', got '{}'",
            url.scheme()
        )));
    }

    pg_config.host = Some(
        url.host_str()
            .ok_or_else(|| StorageError::Pool("Missing host in DATABASE_URL".to_string()))?
            .to_string(),
    );
    pg_config.port = Some(url.port().unwrap_or(5432));
    pg_config.user = Some(if !url.username().is_empty() {
        url.username().to_string()
    } else {
        "postgres".to_string()
    });
    pg_config.password = url.password().map(|p| p.to_string());
    pg_config.dbname = Some(url.path().trim_start_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| Some("ledger".to_string()));

    let mut pool_size = DEFAULT_POOL_SIZE;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "connect_timeout" => {
                if let Ok(timeout) = value.parse::<u64>() {
                    pg_config.connect_timeout = Some(std::time::Duration::from_secs(timeout));
                }
            }
            "pool_size" => {
                if let Ok(size) = value.parse::<usize>() {
                    pool_size = size;
                }
            }
            _ => {}
        }
    }

    pg_config.pool = Some(PoolConfig {
        max_size: pool_size,
        timeouts: Timeouts {
            create: Some(std::time::Duration::from_secs(30)),
            wait: Some(std::time::Duration::from_secs(30)),
            recycle: Some(std::time::Duration::from_secs(300)),
        },
        ..Default::default()
    });

    let pool = pg_config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StorageError::Pool(format!("Failed to create database pool: {}", e)))?;

    let conn = pool
        .get()
        .await
        .map_err(|e| StorageError::Pool(format!("Failed to get database connection: {}", e)))?;
    drop(conn);

    info!(target: "ledger::db", max_size = pool_size, "Database connection pool created");
    Ok(Arc::new(pool))
}

/// Creates the ledger tables and indexes if they do not exist. Amount
/// columns are NUMERIC(78, 0) so a full uint256 fits without rounding.
pub async fn setup_schema(pool: &Pool) -> Result<(), StorageError> {
    let client = pool
        .get()
        .await
        .map_err(|e| StorageError::Pool(format!("Failed to get connection from pool: {}", e)))?;

    client
        .batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS position_events (
                -- Natural key: lowercase tx hash, colon, log index
                event_id TEXT PRIMARY KEY,
                token_id BIGINT NOT NULL,
                pool_address BYTEA NOT NULL,
                block_number BIGINT NOT NULL,
                transaction_hash BYTEA NOT NULL,
                log_index BIGINT NOT NULL,
                unix_ts BIGINT NOT NULL,
                event_type SMALLINT NOT NULL,

                -- Participants, present depending on event type
                sender BYTEA,
                owner BYTEA,
                recipient BYTEA,

                -- Position geometry and pool state
                tick_lower INTEGER,
                tick_upper INTEGER,
                tick INTEGER,
                liquidity_delta NUMERIC(78, 0),
                amount0 NUMERIC(78, 0),
                amount1 NUMERIC(78, 0),
                sqrt_price_x96 NUMERIC(78, 0),

                -- Derived pricing
                price1_per_0 DOUBLE PRECISION,
                usd_value DOUBLE PRECISION,

                metadata JSONB
            );
            CREATE INDEX IF NOT EXISTS idx_position_events_token_block
                ON position_events (token_id, block_number);
            CREATE INDEX IF NOT EXISTS idx_position_events_block
                ON position_events (block_number);

            CREATE TABLE IF NOT EXISTS position_transfers (
                transfer_id TEXT PRIMARY KEY,
                token_id BIGINT NOT NULL,
                from_address BYTEA NOT NULL,
                to_address BYTEA NOT NULL,
                block_number BIGINT NOT NULL,
                transaction_hash BYTEA NOT NULL,
                log_index BIGINT NOT NULL,
                unix_ts BIGINT NOT NULL,
                metadata JSONB
            );
            CREATE INDEX IF NOT EXISTS idx_position_transfers_token_block
                ON position_transfers (token_id, block_number);

            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                source TEXT NOT NULL,
                token_id BIGINT NOT NULL,
                last_block BIGINT NOT NULL,
                last_fetched_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (source, token_id)
            );
            "#,
        )
        .await
        .map_err(|e| StorageError::Schema(format!("Failed to initialize ledger schema: {}", e)))?;

    info!(target: "ledger::db", "Ledger schema verified");
    Ok(())
}

/// Cheap readiness probe used at startup, before any worker touches the
/// pool. Catches missing tables earlier than the first upsert would.
pub async fn verify_schema(pool: &Pool) -> Result<(), StorageError> {
    let client = pool
        .get()
        .await
        .map_err(|e| StorageError::Pool(format!("Failed to get database connection: {}", e)))?;

    for table in ["position_events", "position_transfers", "sync_checkpoints"] {
        client
            .execute(&format!("SELECT 1 FROM {} LIMIT 1", table), &[])
            .await
            .map_err(|e| StorageError::Schema(format!("Failed to verify {} table: {}", table, e)))?;
    }
    Ok(())
}
