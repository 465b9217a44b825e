//! Exchange listing backfill.
//!
//! Collection runs usually skip tickers to keep detail responses small. This
//! pass revisits the largest assets of an existing checkpoint that have no
//! exchange edges yet and adds them, reusing the same weight formula with
//! aggregates recomputed from the checkpointed asset nodes.

use crate::checkpoint::{CheckpointError, CheckpointKind, CheckpointStore};
use crate::client::{ApiClient, FetchError};
use crate::config::PipelineConfig;
use crate::enrich::{exchange_links, exchange_listings, fetch_coin_detail, weight_score, Aggregates};
use crate::graph::{GraphAccumulator, GraphSnapshot};
use crate::schemas::{EdgeType, Node, RunMetadata, ASSET_PREFIX};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default number of assets revisited by the backfill
pub const DEFAULT_TOP_ASSETS: usize = 200;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("No in-progress tables at {0:?}; run `collect` first")]
    NoCheckpoint(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Assets selected for the backfill
    pub selected: usize,
    /// Assets whose detail was fetched
    pub visited: usize,
    pub exchange_nodes_added: usize,
    pub exchange_edges_added: usize,
    pub interrupted: bool,
}

/// Asset nodes without any exchange edge, largest market cap first.
pub fn backfill_targets(snapshot: &GraphSnapshot, top: usize) -> Vec<&Node> {
    let listed: HashSet<&str> = snapshot
        .edges
        .iter()
        .filter(|e| e.edge_type == EdgeType::AssetExchange)
        .map(|e| e.src_id.as_str())
        .collect();

    let mut targets: Vec<&Node> = snapshot
        .nodes
        .iter()
        .filter(|n| n.asset.is_some() && !listed.contains(n.node_id.as_str()))
        .collect();
    targets.sort_by(|a, b| market_cap(b).total_cmp(&market_cap(a)));
    targets.truncate(top);
    targets
}

fn market_cap(node: &Node) -> f64 {
    node.asset.as_ref().map(|a| a.market_cap).unwrap_or(0.0)
}

pub struct ExchangeBackfill {
    client: ApiClient,
    config: PipelineConfig,
    checkpoints: CheckpointStore,
    cancel: CancellationToken,
}

impl ExchangeBackfill {
    pub fn new(config: PipelineConfig, cancel: CancellationToken) -> Result<Self, ExchangeError> {
        let client = ApiClient::new(&config)?;
        let checkpoints = CheckpointStore::new(&config.paths.data_dir);
        Ok(Self {
            client,
            config,
            checkpoints,
            cancel,
        })
    }

    /// Add exchange listings for up to `top` assets of the in-progress tables.
    pub async fn run(&self, top: usize) -> Result<BackfillSummary, ExchangeError> {
        if !self.checkpoints.exists(CheckpointKind::InProgress) {
            return Err(ExchangeError::NoCheckpoint(
                self.checkpoints.nodes_path(CheckpointKind::InProgress),
            ));
        }
        let loaded = self.checkpoints.load()?;
        let snapshot = loaded.snapshot;

        let aggregates = Aggregates::from_values(
            snapshot
                .nodes
                .iter()
                .filter_map(|n| n.asset.as_ref())
                .map(|a| (a.market_cap, a.volume_24h)),
        );
        let targets: Vec<Node> = backfill_targets(&snapshot, top).into_iter().cloned().collect();
        info!(
            "Backfilling exchanges for {} assets (total market cap {:.0}, max volume {:.0})",
            targets.len(),
            aggregates.total_market_cap,
            aggregates.max_volume_24h
        );

        let mut graph = GraphAccumulator::new();
        graph.merge(snapshot);
        let mut summary = BackfillSummary {
            selected: targets.len(),
            ..Default::default()
        };

        let result = self.visit(&targets, &aggregates, &mut graph, &mut summary).await;
        if summary.exchange_edges_added > 0 {
            self.checkpoints
                .save(&graph.snapshot(), CheckpointKind::InProgress)?;
        }
        result?;

        info!(
            "Exchange backfill: {} assets visited, {} exchange nodes and {} edges added{}",
            summary.visited,
            summary.exchange_nodes_added,
            summary.exchange_edges_added,
            if summary.interrupted { " (interrupted)" } else { "" }
        );
        self.write_metadata(&graph);
        Ok(summary)
    }

    async fn visit(
        &self,
        targets: &[Node],
        aggregates: &Aggregates,
        graph: &mut GraphAccumulator,
        summary: &mut BackfillSummary,
    ) -> Result<(), FetchError> {
        for (i, node) in targets.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                return Ok(());
            }
            let coin_id = node.node_id.strip_prefix(ASSET_PREFIX).unwrap_or(&node.node_id);

            let detail = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.interrupted = true;
                    return Ok(());
                }
                detail = fetch_coin_detail(&self.client, coin_id, true, false) => detail,
            };
            let detail = match detail {
                Ok(detail) => detail,
                Err(FetchError::NotFound { url }) => {
                    warn!("Skipping {}: {} no longer exists", node.node_id, url);
                    continue;
                }
                Err(e) => return Err(e),
            };
            summary.visited += 1;

            let (mc, vol) = node
                .asset
                .as_ref()
                .map(|a| (a.market_cap, a.volume_24h))
                .unwrap_or_default();
            let weight = weight_score(mc, vol, aggregates);
            let (nodes, edges) =
                exchange_links(&node.node_id, &exchange_listings(&detail.tickers), weight);
            for exchange in nodes {
                if graph.add_node(exchange) {
                    summary.exchange_nodes_added += 1;
                }
            }
            for edge in edges {
                if graph.add_edge(edge) {
                    summary.exchange_edges_added += 1;
                }
            }

            if i + 1 < targets.len() {
                let pause = self.config.collection.detail_pause();
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        summary.interrupted = true;
                        return Ok(());
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        Ok(())
    }

    fn write_metadata(&self, graph: &GraphAccumulator) {
        let categories = self
            .config
            .categories
            .iter()
            .map(|c| c.label.clone())
            .collect();
        let metadata = RunMetadata::new("exchange-backfill", categories, graph.snapshot().counts());
        let path = self
            .config
            .paths
            .metadata_dir
            .join("exchange_backfill_metadata.json");

        let result = std::fs::create_dir_all(&self.config.paths.metadata_dir)
            .map_err(anyhow::Error::from)
            .and_then(|_| metadata.save(&path));
        if let Err(e) = result {
            warn!("Failed to write backfill metadata to {:?}: {}", path, e);
        }
    }
}
