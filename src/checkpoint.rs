//! Checkpoint store: persists each token's sync cursor for crash recovery.
//!
//! A checkpoint records the last block whose logs were durably written for a
//! `(source, token_id)` pair, plus when that happened. Incremental backfills
//! resume from the cursor instead of rescanning history, and the staleness
//! sweep uses `last_fetched_at` to decide which tokens need work.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use tracing::debug;

use crate::errors::StorageError;
use crate::types::Checkpoint;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the cursor for one token, `None` if it has never been synced.
    async fn load(&self, source: &str, token_id: u64) -> Result<Option<Checkpoint>, StorageError>;

    /// Loads every cursor recorded under a source.
    async fn load_all(&self, source: &str) -> Result<Vec<Checkpoint>, StorageError>;

    /// Upserts a cursor. The stored `last_block` never moves backward:
    /// writing a lower block keeps the old one and only refreshes
    /// `last_fetched_at`.
    async fn advance(&self, checkpoint: Checkpoint) -> Result<(), StorageError>;

    /// Deletes cursors so the next sync starts from scratch. An empty
    /// `token_ids` slice clears everything under the source. Returns the
    /// number of cursors removed.
    async fn clear(&self, source: &str, token_ids: &[u64]) -> Result<u64, StorageError>;
}

//================================================================================================//
//                                     POSTGRES-BACKED STORE                                      //
//================================================================================================//

pub struct PostgresCheckpointStore {
    pool: Arc<Pool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    fn row_to_checkpoint(row: &Row) -> Result<Checkpoint, StorageError> {
        let token_id: i64 = row.try_get("token_id")?;
        Ok(Checkpoint {
            source: row.try_get("source")?,
            token_id: token_id as u64,
            last_block: row.try_get::<_, i64>("last_block")? as u64,
            last_fetched_at: row.try_get("last_fetched_at")?,
        })
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, source: &str, token_id: u64) -> Result<Option<Checkpoint>, StorageError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT source, token_id, last_block, last_fetched_at \
                 FROM sync_checkpoints WHERE source = $1 AND token_id = $2",
                &[&source, &(token_id as i64)],
            )
            .await?;
        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn load_all(&self, source: &str) -> Result<Vec<Checkpoint>, StorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT source, token_id, last_block, last_fetched_at \
                 FROM sync_checkpoints WHERE source = $1 ORDER BY token_id",
                &[&source],
            )
            .await?;
        rows.iter().map(Self::row_to_checkpoint).collect()
    }

    async fn advance(&self, checkpoint: Checkpoint) -> Result<(), StorageError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO sync_checkpoints (source, token_id, last_block, last_fetched_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (source, token_id) DO UPDATE SET \
                     last_block = GREATEST(sync_checkpoints.last_block, EXCLUDED.last_block), \
                     last_fetched_at = EXCLUDED.last_fetched_at",
                &[
                    &checkpoint.source,
                    &(checkpoint.token_id as i64),
                    &(checkpoint.last_block as i64),
                    &checkpoint.last_fetched_at,
                ],
            )
            .await?;
        debug!(
            target: "ledger::checkpoint",
            source = %checkpoint.source,
            token_id = checkpoint.token_id,
            last_block = checkpoint.last_block,
            "Checkpoint advanced"
        );
        Ok(())
    }

    async fn clear(&self, source: &str, token_ids: &[u64]) -> Result<u64, StorageError> {
        let client = self.pool.get().await?;
        let deleted = if token_ids.is_empty() {
            client
                .execute("DELETE FROM sync_checkpoints WHERE source = $1", &[&source])
                .await?
        } else {
            let ids: Vec<i64> = token_ids.iter().map(|id| *id as i64).collect();
            client
                .execute(
                    "DELETE FROM sync_checkpoints WHERE source = $1 AND token_id = ANY($2)",
                    &[&source, &ids],
                )
                .await?
        };
        Ok(deleted)
    }
}

//================================================================================================//
//                                      IN-MEMORY STORE                                           //
//================================================================================================//

/// HashMap-backed store with the same monotone semantics as the Postgres
/// one. Used by tests and by dry runs that should not touch the database.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: std::sync::RwLock<HashMap<(String, u64), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source: &str, token_id: u64) -> Result<Option<Checkpoint>, StorageError> {
        let map = self
            .inner
            .read()
            .map_err(|_| StorageError::Pool("checkpoint store lock poisoned".to_string()))?;
        Ok(map.get(&(source.to_string(), token_id)).cloned())
    }

    async fn load_all(&self, source: &str) -> Result<Vec<Checkpoint>, StorageError> {
        let map = self
            .inner
            .read()
            .map_err(|_| StorageError::Pool("checkpoint store lock poisoned".to_string()))?;
        let mut checkpoints: Vec<Checkpoint> = map
            .values()
            .filter(|cp| cp.source == source)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|cp| cp.token_id);
        Ok(checkpoints)
    }

    async fn advance(&self, checkpoint: Checkpoint) -> Result<(), StorageError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| StorageError::Pool("checkpoint store lock poisoned".to_string()))?;
        let key = (checkpoint.source.clone(), checkpoint.token_id);
        match map.get_mut(&key) {
            Some(existing) => {
                existing.last_block = existing.last_block.max(checkpoint.last_block);
                existing.last_fetched_at = checkpoint.last_fetched_at;
            }
            None => {
                map.insert(key, checkpoint);
            }
        }
        Ok(())
    }

    async fn clear(&self, source: &str, token_ids: &[u64]) -> Result<u64, StorageError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| StorageError::Pool("checkpoint store lock poisoned".to_string()))?;
        let before = map.len();
        if token_ids.is_empty() {
            map.retain(|(s, _), _| s != source);
        } else {
            for token_id in token_ids {
                map.remove(&(source.to_string(), *token_id));
            }
        }
        Ok((before - map.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn advance_never_moves_backward() {
        let store = MemoryCheckpointStore::new();
        store.advance(Checkpoint::new("chain", 5, 100)).await.unwrap();

        let stale = Checkpoint::new("chain", 5, 40);
        store.advance(stale.clone()).await.unwrap();

        let cp = store.load("chain", 5).await.unwrap().unwrap();
        assert_eq!(cp.last_block, 100);
        assert_eq!(cp.last_fetched_at, stale.last_fetched_at);
    }

    #[tokio::test]
    async fn advance_refreshes_fetch_time_even_without_progress() {
        let store = MemoryCheckpointStore::new();
        let mut first = Checkpoint::new("chain", 9, 50);
        first.last_fetched_at = Utc::now() - chrono::Duration::hours(3);
        store.advance(first).await.unwrap();

        store.advance(Checkpoint::new("chain", 9, 50)).await.unwrap();
        let cp = store.load("chain", 9).await.unwrap().unwrap();
        assert!(Utc::now().signed_duration_since(cp.last_fetched_at) < chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn load_is_scoped_by_source() {
        let store = MemoryCheckpointStore::new();
        store.advance(Checkpoint::new("chain", 1, 10)).await.unwrap();
        store.advance(Checkpoint::new("api", 1, 99)).await.unwrap();

        assert_eq!(store.load("chain", 1).await.unwrap().unwrap().last_block, 10);
        assert_eq!(store.load("api", 1).await.unwrap().unwrap().last_block, 99);
        assert!(store.load("chain", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_selected_tokens() {
        let store = MemoryCheckpointStore::new();
        for token_id in [1u64, 2, 3] {
            store.advance(Checkpoint::new("chain", token_id, 10)).await.unwrap();
        }

        let removed = store.clear("chain", &[1, 3]).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.load("chain", 1).await.unwrap().is_none());
        assert!(store.load("chain", 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_all_for_source() {
        let store = MemoryCheckpointStore::new();
        store.advance(Checkpoint::new("chain", 1, 10)).await.unwrap();
        store.advance(Checkpoint::new("chain", 2, 20)).await.unwrap();
        store.advance(Checkpoint::new("api", 7, 30)).await.unwrap();

        let removed = store.clear("chain", &[]).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.load_all("chain").await.unwrap().is_empty());
        assert_eq!(store.load_all("api").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn load_all_is_sorted_by_token() {
        let store = MemoryCheckpointStore::new();
        for token_id in [30u64, 10, 20] {
            store.advance(Checkpoint::new("chain", token_id, 5)).await.unwrap();
        }
        let all = store.load_all("chain").await.unwrap();
        let ids: Vec<u64> = all.iter().map(|cp| cp.token_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }
}
