//! Crypto Asset Graph Pipeline Library
//!
//! A resumable, rate-limited collector that turns CoinGecko category listings
//! into a typed knowledge graph of assets, categories, block explorers and
//! exchanges.
//!
//! # Pipeline Stages
//!
//! 1. **Category Resolution** ([`category`]): Resolves each configured category through its slug aliases
//! 2. **Detail Enrichment** ([`enrich`]): Fetches per-asset details and derives explorers, wallets and weights
//! 3. **Graph Accumulation** ([`graph`]): Deduplicating node/edge accumulation
//! 4. **Checkpointing** ([`checkpoint`]): Atomic CSV persistence for resume
//! 5. **Exchange Backfill** ([`exchanges`]): Adds exchange listings to an existing checkpoint
//!
//! All HTTP traffic goes through [`client::ApiClient`], which paces, retries
//! and caches requests.
//!
//! # Output Files
//!
//! - `nodes_tmp.csv` / `edges_tmp.csv`: In-progress tables, loaded on resume
//! - `nodes.csv` / `edges.csv`: Tables of the last completed run
//! - `metadata/run_metadata.json`: Run outcome and record counts
//!
//! # Example
//!
//! ```no_run
//! use crypto_graph_pipeline::config::PipelineConfig;
//! use crypto_graph_pipeline::pipeline::Collector;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let collector = Collector::new(config, CancellationToken::new())?;
//!     let outcome = collector.run().await?;
//!     println!("Collected {} nodes", outcome.counts().nodes());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod category;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod enrich;
pub mod exchanges;
pub mod graph;
pub mod pipeline;
pub mod schemas;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use pipeline::{Collector, RunOutcome};
pub use schemas::{Edge, EdgeType, Node, NodeType, RecordCounts, RunMetadata};
