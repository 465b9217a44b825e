//! Crypto Asset Graph Pipeline CLI
//!
//! Collects CoinGecko category listings and asset details into a resumable
//! knowledge graph of assets, categories, explorers and exchanges.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crypto_graph_pipeline::checkpoint::{CheckpointKind, CheckpointStore};
use crypto_graph_pipeline::config::PipelineConfig;
use crypto_graph_pipeline::exchanges::{ExchangeBackfill, DEFAULT_TOP_ASSETS};
use crypto_graph_pipeline::pipeline::{Collector, RunOutcome};

#[derive(Parser)]
#[command(name = "crypto-graph")]
#[command(author = "Crypto Graph Team")]
#[command(version)]
#[command(about = "CoinGecko category collector and asset graph builder", long_about = None)]
struct Cli {
    /// Path to configuration file (optional, uses env vars if not provided)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output directory for tables, cache and metadata
    #[arg(short, long, global = true, default_value = "data")]
    output_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect (or resume collecting) the asset graph
    Collect {
        /// Fetch exchange tickers with each asset detail
        #[arg(long)]
        include_tickers: bool,

        /// Maximum assets per category (defaults to the configured limit)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Add exchange listings to the largest assets of the in-progress tables
    EnrichExchanges {
        /// Number of assets to revisit, by market cap
        #[arg(short, long, default_value_t = DEFAULT_TOP_ASSETS)]
        top: usize,
    },

    /// Show table counts and metadata files
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => PipelineConfig::load().context("Failed to load config from environment")?,
    };

    // Override output directory if specified
    config.set_output_dir(&cli.output_dir);
    config.ensure_directories()?;

    match cli.command {
        Commands::Collect {
            include_tickers,
            limit,
        } => {
            cmd_collect(config, include_tickers, limit).await?;
        }
        Commands::EnrichExchanges { top } => {
            cmd_enrich_exchanges(config, top).await?;
        }
        Commands::Status => {
            cmd_status(&config)?;
        }
    }

    Ok(())
}

/// Cancel `token` on the first Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => warn!("Received Ctrl+C, saving progress and stopping"),
                    Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
                }
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

async fn cmd_collect(
    mut config: PipelineConfig,
    include_tickers: bool,
    limit: Option<usize>,
) -> Result<()> {
    if include_tickers {
        config.collection.include_tickers = true;
    }
    if let Some(limit) = limit {
        config.per_category_limit = limit;
        config.validate()?;
    }

    info!(
        "Collecting {} categories (limit {} per category, tickers {})",
        config.categories.len(),
        config.per_category_limit,
        if config.collection.include_tickers { "on" } else { "off" }
    );

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    let collector = Collector::new(config.clone(), token.clone())
        .context("Failed to initialize collector")?;
    let result = collector.run().await;
    token.cancel();
    info!("{} live API requests", collector.live_requests());

    match result.context("Collection failed")? {
        RunOutcome::Completed { counts } => {
            info!(
                "Collection complete: {} nodes, {} edges written to {:?}",
                counts.nodes(),
                counts.edges(),
                config.paths.data_dir
            );
        }
        RunOutcome::Interrupted { counts } => {
            warn!(
                "Collection interrupted: {} nodes, {} edges checkpointed; run `collect` again to resume",
                counts.nodes(),
                counts.edges()
            );
        }
    }

    Ok(())
}

async fn cmd_enrich_exchanges(config: PipelineConfig, top: usize) -> Result<()> {
    info!("=== Exchange Backfill ===");

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    let backfill =
        ExchangeBackfill::new(config, token.clone()).context("Failed to initialize backfill")?;
    let result = backfill.run(top).await;
    token.cancel();

    let summary = result.context("Exchange backfill failed")?;
    if summary.interrupted {
        warn!(
            "Backfill interrupted after {}/{} assets",
            summary.visited, summary.selected
        );
    }

    Ok(())
}

fn cmd_status(config: &PipelineConfig) -> Result<()> {
    info!("=== Pipeline Status ===");
    info!("Data directory: {:?}", config.paths.data_dir);

    let store = CheckpointStore::new(&config.paths.data_dir);
    for (name, kind) in [
        ("In-progress", CheckpointKind::InProgress),
        ("Final", CheckpointKind::Final),
    ] {
        match store.read(kind) {
            Ok(Some(snapshot)) => {
                let counts = snapshot.counts();
                info!(
                    "  {} {} tables {:?}: {} nodes, {} edges",
                    "✓",
                    name,
                    store.nodes_path(kind),
                    counts.nodes(),
                    counts.edges()
                );
                info!(
                    "      assets={} categories={} explorers={} exchanges={}",
                    counts.asset_nodes,
                    counts.category_nodes,
                    counts.explorer_nodes,
                    counts.exchange_nodes
                );
                info!(
                    "      asset-category={} asset-explorer={} asset-exchange={}",
                    counts.category_edges, counts.explorer_edges, counts.exchange_edges
                );
            }
            Ok(None) => info!("  {} {} tables: not found", "✗", name),
            Err(e) => warn!("  {} {} tables unreadable: {}", "✗", name, e),
        }
    }

    info!("Metadata files:");
    for file in ["run_metadata.json", "exchange_backfill_metadata.json"] {
        let path = config.paths.metadata_dir.join(file);
        if path.exists() {
            info!("  {} {}", "✓", file);
        } else {
            info!("  {} {}", "✗", file);
        }
    }

    Ok(())
}
