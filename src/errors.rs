//! # Centralized Error Handling
//!
//! This module defines the hierarchical error enums for the indexer. Every
//! fallible path returns a typed error so callers can distinguish transient
//! upstream failures (worth retrying) from storage or configuration faults.

use deadpool_postgres::PoolError;
use thiserror::Error;

/// The top-level error type, encapsulating all failures within the indexer.
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Normalization error: {0}")]
    Normalize(String),
    #[error("Task join error: {0}")]
    Join(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("System shut down")]
    Shutdown,
    #[error("Other error: {0}")]
    Other(String),
}

/// Errors raised while talking to an event source (RPC node or indexer API).
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Rate limit error: {0}")]
    RateLimited(String),
    #[error("Log decoding error: {0}")]
    Decode(String),
    #[error("Pagination error: {0}")]
    Pagination(String),
    #[error("Block {0} not found")]
    BlockNotFound(u64),
    #[error("Serialization/Deserialization error: {0}")]
    Serde(String),
    #[error("Other upstream error: {0}")]
    Other(String),
}

impl UpstreamError {
    /// Transient failures are retried by the backoff wrapper; decode and
    /// serde faults are permanent for a given payload and fail fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Timeout { .. } => true,
            UpstreamError::RateLimited(_) => true,
            UpstreamError::Rpc(_) => true,
            UpstreamError::Http { status, .. } => *status == 429 || *status >= 500,
            UpstreamError::BlockNotFound(_) => true,
            UpstreamError::Decode(_) => false,
            UpstreamError::Pagination(_) => false,
            UpstreamError::Serde(_) => false,
            UpstreamError::Other(_) => false,
        }
    }
}

/// Errors raised by the Postgres-backed ledger and checkpoint stores.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database connection pool error: {0}")]
    Pool(String),
    #[error("Database query or execution error: {0}")]
    Query(String),
    #[error("Transaction error during database operation: {0}")]
    Transaction(String),
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Data serialization or deserialization error: {0}")]
    Serialization(String),
}

impl From<PoolError> for StorageError {
    fn from(err: PoolError) -> Self {
        StorageError::Pool(err.to_string())
    }
}

impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::Query(err.to_string())
    }
}

impl From<ethers::providers::ProviderError> for UpstreamError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        UpstreamError::Rpc(err.to_string())
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout { elapsed_ms: 0 }
        } else {
            match err.status() {
                Some(status) => UpstreamError::Http {
                    status: status.as_u16(),
                    body: err.to_string(),
                },
                None => UpstreamError::Other(err.to_string()),
            }
        }
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Serde(err.to_string())
    }
}

impl From<tokio::task::JoinError> for IndexerError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexerError::Join(err.to_string())
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        IndexerError::Config(err.to_string())
    }
}
