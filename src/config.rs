// src/config.rs

//! # Modular Configuration System
//!
//! This module provides a configuration system that loads settings from a
//! directory of specialized JSON files. The main `Config` struct acts as the
//! single source of truth for all indexer parameters; `main.json` carries
//! the service-level knobs and `chains.json` the per-chain connectivity.

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};

use crate::errors::IndexerError;

//================================================================================================//
//                                       Top-Level Config                                         //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    /// Connection string for the ledger database. The DATABASE_URL
    /// environment variable takes precedence when set.
    pub database_url: Option<String>,
    pub backfill: BackfillSettings,
    pub upstream: UpstreamSettings,
    pub chain_config: ChainConfig,
}

/// Shape of `main.json` on disk. Everything is optional so a minimal file
/// still loads; defaults fill the gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MainConfig {
    log_level: Option<String>,
    database_url: Option<String>,
    #[serde(default)]
    backfill: BackfillSettings,
    #[serde(default)]
    upstream: UpstreamSettings,
}

/// Knobs for the backfill orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSettings {
    /// Number of tokens synced in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// A checkpoint younger than this is fresh and auto-sync skips the token.
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: u64,
    /// Rows per multi-row upsert statement.
    #[serde(default = "default_upsert_chunk_size")]
    pub upsert_chunk_size: usize,
    /// Cadence of the background staleness sweep.
    #[serde(default = "default_auto_sync_interval_secs")]
    pub auto_sync_interval_secs: u64,
}

fn default_concurrency() -> usize {
    4
}
fn default_staleness_window_secs() -> u64 {
    3600
}
fn default_upsert_chunk_size() -> usize {
    500
}
fn default_auto_sync_interval_secs() -> u64 {
    300
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            staleness_window_secs: default_staleness_window_secs(),
            upsert_chunk_size: default_upsert_chunk_size(),
            auto_sync_interval_secs: default_auto_sync_interval_secs(),
        }
    }
}

/// Rate limiting and retry knobs shared by all upstream sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    #[serde(default = "default_rps_limit")]
    pub default_rps_limit: u32,
    #[serde(default = "default_burst_size")]
    pub rate_limit_burst_size: u32,
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent_requests: u32,
    /// Attempts per upstream call, including the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Deadline for a single RPC round trip.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Deadline for a single indexer API page.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Records requested per indexer API page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_rps_limit() -> u32 {
    25
}
fn default_burst_size() -> u32 {
    5
}
fn default_max_concurrent() -> u32 {
    8
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    250
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    4_000
}
fn default_jitter_factor() -> f64 {
    0.1
}
fn default_rpc_timeout_ms() -> u64 {
    1_200
}
fn default_http_timeout_ms() -> u64 {
    10_000
}
fn default_page_size() -> u32 {
    100
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            default_rps_limit: default_rps_limit(),
            rate_limit_burst_size: default_burst_size(),
            default_max_concurrent_requests: default_max_concurrent(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_factor: default_jitter_factor(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            page_size: default_page_size(),
        }
    }
}

//================================================================================================//
//                                       Per-Chain Config                                         //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chains: HashMap<String, PerChainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerChainConfig {
    pub chain_id: u64,
    pub chain_name: String,
    pub rpc_url: String,
    /// NFT position manager whose logs this indexer walks.
    pub position_manager: Address,
    /// Block the position manager was deployed at. Full backfills start
    /// here; scanning earlier blocks can only return nothing.
    pub genesis_block: u64,
    /// Widest block range a single eth_getLogs may cover.
    pub max_blocks_per_query: Option<u64>,
    pub rps_limit: Option<u32>,
    pub max_concurrent_requests: Option<u32>,
    /// Optional indexer API endpoint. When present the API source is
    /// available as an alternative to direct chain reads.
    pub indexer_api_url: Option<String>,
    pub indexer_api_key: Option<String>,
    pub avg_block_time_seconds: Option<f64>,
    pub is_test_environment: Option<bool>,
}

impl PerChainConfig {
    pub fn max_blocks_per_query(&self) -> u64 {
        self.max_blocks_per_query.unwrap_or(2_000)
    }
}

//================================================================================================//
//                                          Loading                                              //
//================================================================================================//

impl Config {
    pub async fn load_from_directory<P: AsRef<Path>>(dir: P) -> Result<Self, IndexerError> {
        let dir = dir.as_ref();
        let main_config: MainConfig = Self::load_file(dir.join("main.json")).await?;
        let chain_config: ChainConfig = Self::load_file(dir.join("chains.json")).await?;

        let config = Self {
            log_level: main_config.log_level.unwrap_or_else(|| "info".to_string()),
            database_url: main_config.database_url,
            backfill: main_config.backfill,
            upstream: main_config.upstream,
            chain_config,
        };
        config.validate()?;
        Ok(config)
    }

    async fn load_file<T: for<'de> Deserialize<'de>>(
        path: impl AsRef<Path>,
    ) -> Result<T, IndexerError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            IndexerError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            IndexerError::Config(format!(
                "Failed to parse config from JSON {} (line {}, column {}): {}",
                path.display(),
                e.line(),
                e.column(),
                e
            ))
        })
    }

    /// The DATABASE_URL environment variable overrides the file setting.
    pub fn database_url(&self) -> Option<String> {
        std::env::var("DATABASE_URL").ok().or_else(|| self.database_url.clone())
    }

    pub fn get_chain(&self, name: &str) -> Result<&PerChainConfig, IndexerError> {
        self.chain_config
            .chains
            .get(name)
            .ok_or_else(|| IndexerError::Config(format!("Chain '{}' not found in chains.json", name)))
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.backfill.concurrency == 0 {
            return Err(IndexerError::Config(
                "backfill.concurrency must be at least 1".to_string(),
            ));
        }
        if self.upstream.page_size == 0 {
            return Err(IndexerError::Config(
                "upstream.page_size must be at least 1".to_string(),
            ));
        }
        if self.backfill.upsert_chunk_size == 0 {
            return Err(IndexerError::Config(
                "backfill.upsert_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.upstream.max_retries == 0 {
            return Err(IndexerError::Config(
                "upstream.max_retries must be at least 1".to_string(),
            ));
        }
        for (name, chain) in &self.chain_config.chains {
            if chain.rpc_url.is_empty() {
                return Err(IndexerError::Config(format!("Chain '{}' has an empty rpc_url", name)));
            }
            if chain.max_blocks_per_query() == 0 {
                return Err(IndexerError::Config(format!(
                    "Chain '{}' has max_blocks_per_query of 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chain() -> PerChainConfig {
        PerChainConfig {
            chain_id: 14,
            chain_name: "flare".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            position_manager: Address::repeat_byte(0x11),
            genesis_block: 1_000,
            max_blocks_per_query: None,
            rps_limit: None,
            max_concurrent_requests: None,
            indexer_api_url: None,
            indexer_api_key: None,
            avg_block_time_seconds: Some(1.8),
            is_test_environment: Some(true),
        }
    }

    fn test_config() -> Config {
        let mut chains = HashMap::new();
        chains.insert("flare".to_string(), test_chain());
        Config {
            log_level: "info".to_string(),
            database_url: None,
            backfill: BackfillSettings::default(),
            upstream: UpstreamSettings::default(),
            chain_config: ChainConfig { chains },
        }
    }

    #[test]
    fn defaults_are_sane() {
        let settings = BackfillSettings::default();
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.staleness_window_secs, 3600);

        let upstream = UpstreamSettings::default();
        assert_eq!(upstream.max_retries, 3);
        assert_eq!(upstream.rpc_timeout_ms, 1_200);
    }

    #[test]
    fn minimal_main_json_parses() {
        let parsed: MainConfig = serde_json::from_str(r#"{"log_level": "debug"}"#).unwrap();
        assert_eq!(parsed.log_level.as_deref(), Some("debug"));
        assert_eq!(parsed.backfill.concurrency, 4);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = test_config();
        config.backfill.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_chain_is_an_error() {
        let config = test_config();
        assert!(config.get_chain("flare").is_ok());
        assert!(config.get_chain("songbird").is_err());
    }

    #[tokio::test]
    async fn load_from_directory_reads_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let main = r#"{"log_level": "debug", "backfill": {"concurrency": 2}}"#;
        let chains = r#"{"chains": {"flare": {
            "chain_id": 14,
            "chain_name": "flare",
            "rpc_url": "http://localhost:8545",
            "position_manager": "0x1111111111111111111111111111111111111111",
            "genesis_block": 1000
        }}}"#;
        tokio::fs::write(dir.path().join("main.json"), main).await.unwrap();
        tokio::fs::write(dir.path().join("chains.json"), chains).await.unwrap();

        let config = Config::load_from_directory(dir.path()).await.unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.backfill.concurrency, 2);
        assert_eq!(config.upstream.page_size, 100);
        assert_eq!(config.get_chain("flare").unwrap().genesis_block, 1_000);
    }

    #[tokio::test]
    async fn missing_config_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from_directory(dir.path()).await.unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }
}
