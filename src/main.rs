//! CLI entry point for the position ledger.
//!
//! 1. Load configuration (`config/main.json` + `config/chains.json`) and
//!    initialise tracing.
//! 2. Build the storage pool, bootstrap the schema, and construct the
//!    configured upstream source behind its rate limiter.
//! 3. Dispatch the subcommand: one-shot backfill, status report, admin
//!    clear, or a periodic background-sync watch.
//! 4. Ctrl-C cancels the in-flight batch through a `CancellationToken`;
//!    tokens already written keep their advanced checkpoints.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::str::FromStr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use position_ledger::backfill::BackfillOrchestrator;
use position_ledger::checkpoint::{CheckpointStore, PostgresCheckpointStore};
use position_ledger::config::Config;
use position_ledger::database;
use position_ledger::ledger::{LedgerStore, PostgresLedgerStore};
use position_ledger::normalizer::EventNormalizer;
use position_ledger::rate_limiter::global_rate_limiter;
use position_ledger::types::{BackfillMode, BackfillRequest};
use position_ledger::upstream::{build_source, SourceKind, UpstreamSource};

#[derive(Parser)]
#[command(name = "position-ledger")]
#[command(about = "Backfills on-chain LP position history into a Postgres ledger", version)]
struct Args {
    /// Directory holding main.json and chains.json.
    #[arg(long, default_value = "config")]
    config_dir: String,
    /// Chain entry from chains.json to operate on.
    #[arg(long, default_value = "flare")]
    chain: String,
    /// Upstream variant: "chain" (direct RPC) or "api" (indexer).
    #[arg(long, default_value = "chain")]
    source: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill position history for a set of tokens.
    Backfill {
        /// Comma-separated position token ids.
        #[arg(long, value_delimiter = ',', required = true)]
        token_ids: Vec<u64>,
        /// "full" rescans from the deployment block; "since" resumes from
        /// each token's checkpoint.
        #[arg(long, default_value = "since")]
        mode: String,
        /// Explicit lower bound, overriding checkpoints.
        #[arg(long)]
        since_block: Option<u64>,
        /// Explicit upper bound; defaults to the chain head.
        #[arg(long)]
        to_block: Option<u64>,
        /// Worker lanes for this batch.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Report ledger counts and checkpoints.
    Status {
        /// Restrict the checkpoint listing to these tokens.
        #[arg(long, value_delimiter = ',')]
        token_ids: Vec<u64>,
    },
    /// Delete ledger rows and checkpoints for tokens. Their next "since"
    /// sync implicitly runs full.
    Clear {
        #[arg(long, value_delimiter = ',', required = true)]
        token_ids: Vec<u64>,
    },
    /// Periodically re-sync stale tokens until interrupted.
    Watch {
        #[arg(long, value_delimiter = ',', required = true)]
        token_ids: Vec<u64>,
    },
}

struct AppContext {
    orchestrator: Arc<BackfillOrchestrator>,
    ledger: Arc<dyn LedgerStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    source: Arc<dyn UpstreamSource>,
}

async fn build_context(
    config: &Config,
    chain_name: &str,
    source_arg: &str,
    cancellation: CancellationToken,
) -> Result<AppContext> {
    let chain = config.get_chain(chain_name)?;
    let kind = SourceKind::from_str(source_arg).map_err(|e| anyhow!(e))?;

    let database_url = config
        .database_url()
        .ok_or_else(|| anyhow!("No database URL: set DATABASE_URL or database_url in main.json"))?;
    let pool = database::create_database_pool(&database_url)
        .await
        .context("Failed to build database pool")?;
    database::setup_schema(&pool).await?;
    database::verify_schema(&pool).await?;

    let settings = Arc::new(config.upstream.clone());
    let global_limiter = global_rate_limiter(&settings);
    let source = build_source(kind, chain, settings, global_limiter)?;

    let ledger: Arc<dyn LedgerStore> = Arc::new(PostgresLedgerStore::new(
        pool.clone(),
        config.backfill.upsert_chunk_size,
    ));
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(PostgresCheckpointStore::new(pool));
    let normalizer = Arc::new(EventNormalizer::new(chain.position_manager));

    let orchestrator = Arc::new(BackfillOrchestrator::new(
        source.clone(),
        checkpoints.clone(),
        ledger.clone(),
        normalizer,
        config.backfill.clone(),
        chain,
        cancellation,
    ));

    Ok(AppContext {
        orchestrator,
        ledger,
        checkpoints,
        source,
    })
}

fn spawn_ctrl_c_handler(cancellation: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("SIGINT - cancelling in-flight work");
            cancellation.cancel();
        }
    });
}

fn print_summary(summary: &position_ledger::types::BackfillSummary) {
    for result in &summary.results {
        match &result.error {
            None => println!(
                "token {:>10}  ok      events={} transfers={} range=[{}, {}] {}ms",
                result.token_id,
                result.events_written,
                result.transfers_written,
                result.from_block,
                result.to_block,
                result.elapsed_ms
            ),
            Some(error) => println!("token {:>10}  FAILED  {}", result.token_id, error),
        }
    }
    println!(
        "{} tokens: {} successful, {} failed ({}ms)",
        summary.total, summary.successful, summary.failed, summary.total_elapsed_ms
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load_from_directory(&args.config_dir)
        .await
        .context("Failed to load configuration")?;

    let filter = EnvFilter::from_default_env()
        .add_directive(config.log_level.parse()?)
        .add_directive("ethers_providers=warn".parse()?)
        .add_directive("tokio_postgres=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cancellation = CancellationToken::new();
    let context = build_context(&config, &args.chain, &args.source, cancellation.clone()).await?;

    match args.command {
        Commands::Backfill {
            token_ids,
            mode,
            since_block,
            to_block,
            concurrency,
        } => {
            let mode = BackfillMode::from_str(&mode).map_err(|e| anyhow!(e))?;
            spawn_ctrl_c_handler(cancellation.clone());

            let request = BackfillRequest {
                token_ids,
                mode,
                since_block,
                to_block,
                concurrency,
            };
            let summary = context
                .orchestrator
                .clone()
                .backfill_positions(request)
                .await?;
            print_summary(&summary);

            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Commands::Status { token_ids } => {
            let counts = context.ledger.counts().await?;
            println!(
                "ledger: {} events, {} transfers, {} distinct tokens",
                counts.events, counts.transfers, counts.distinct_tokens
            );

            let mut checkpoints = context.checkpoints.load_all(context.source.name()).await?;
            if !token_ids.is_empty() {
                checkpoints.retain(|cp| token_ids.contains(&cp.token_id));
            }
            if checkpoints.is_empty() {
                println!("no checkpoints for source '{}'", context.source.name());
            }
            for cp in checkpoints {
                println!(
                    "token {:>10}  last_block={} last_fetched_at={}",
                    cp.token_id, cp.last_block, cp.last_fetched_at
                );
            }
        }
        Commands::Clear { token_ids } => {
            let outcome = context.orchestrator.clear(&token_ids).await?;
            println!(
                "cleared {} ledger rows and {} checkpoints for {} tokens",
                outcome.ledger_rows_deleted,
                outcome.checkpoints_cleared,
                token_ids.len()
            );
        }
        Commands::Watch { token_ids } => {
            info!(
                tokens = token_ids.len(),
                interval_secs = config.backfill.auto_sync_interval_secs,
                "Watching tokens; Ctrl-C to stop"
            );
            let sweeper = context.orchestrator.clone().spawn_periodic_sync(token_ids);

            signal::ctrl_c().await?;
            info!("SIGINT - stopping watch");
            cancellation.cancel();
            if let Err(e) = sweeper.await {
                warn!(error = %e, "Sweep task ended abnormally");
            }
        }
    }

    Ok(())
}
