//! Collection run orchestration.
//!
//! A run resolves every configured category into an asset universe, computes
//! the global normalization values once, then enriches assets one at a time,
//! checkpointing as it goes. Cancellation and fatal errors both end in an
//! atomic save of the in-progress tables, so the next run resumes where this
//! one stopped.

use crate::category::CategoryResolver;
use crate::checkpoint::{CheckpointError, CheckpointKind, CheckpointStore};
use crate::client::{ApiClient, FetchError};
use crate::config::PipelineConfig;
use crate::enrich::{Aggregates, AssetCandidate, DetailEnricher};
use crate::graph::GraphAccumulator;
use crate::schemas::{Node, RecordCounts, RunMetadata};
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Stages of a collection run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    ResolvingCategories,
    ComputingAggregates,
    ProcessingAssets,
    Finalizing,
    Done,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::ResolvingCategories => "Resolving Categories",
            RunState::ComputingAggregates => "Computing Aggregates",
            RunState::ProcessingAssets => "Processing Assets",
            RunState::Finalizing => "Finalizing",
            RunState::Done => "Done",
        };
        write!(f, "{name}")
    }
}

fn enter(state: &mut RunState, next: RunState) {
    *state = next;
    info!("=== {} ===", next);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every asset was processed and the final tables were written
    Completed { counts: RecordCounts },
    /// Stopped early; the in-progress tables hold everything processed so far
    Interrupted { counts: RecordCounts },
}

impl RunOutcome {
    pub fn counts(&self) -> &RecordCounts {
        match self {
            RunOutcome::Completed { counts } | RunOutcome::Interrupted { counts } => counts,
        }
    }
}

/// Drives one collection run end to end.
pub struct Collector {
    client: ApiClient,
    config: PipelineConfig,
    checkpoints: CheckpointStore,
    cancel: CancellationToken,
}

impl Collector {
    pub fn new(config: PipelineConfig, cancel: CancellationToken) -> Result<Self, PipelineError> {
        let client = ApiClient::new(&config)?;
        let checkpoints = CheckpointStore::new(&config.paths.data_dir);
        Ok(Self {
            client,
            config,
            checkpoints,
            cancel,
        })
    }

    /// Live HTTP requests sent so far
    pub fn live_requests(&self) -> u64 {
        self.client.live_requests()
    }

    pub async fn run(&self) -> Result<RunOutcome, PipelineError> {
        let mut state = RunState::ResolvingCategories;
        info!("=== {} ===", state);
        let candidates = self.resolve_categories().await?;

        enter(&mut state, RunState::ComputingAggregates);
        let aggregates = Aggregates::from_candidates(&candidates);
        info!(
            "Universe: {} assets, total market cap {:.0}, max 24h volume {:.0}",
            candidates.len(),
            aggregates.total_market_cap,
            aggregates.max_volume_24h
        );

        enter(&mut state, RunState::ProcessingAssets);
        let mut graph = self.restore()?;
        let completed = match self.process_assets(&candidates, &aggregates, &mut graph).await {
            Ok(completed) => completed,
            Err(e) => {
                error!("Collection aborted: {}", e);
                self.checkpoints
                    .save(&graph.snapshot(), CheckpointKind::InProgress)?;
                return Err(e.into());
            }
        };

        enter(&mut state, RunState::Finalizing);
        if !completed {
            let snapshot = graph.snapshot();
            self.checkpoints.save(&snapshot, CheckpointKind::InProgress)?;
            let counts = snapshot.counts();
            warn!(
                "Interrupted after {} processed assets; rerun to resume",
                graph.processed_count()
            );
            self.write_metadata("interrupted", &counts);
            return Ok(RunOutcome::Interrupted { counts });
        }

        let snapshot = graph.finalize();
        self.checkpoints.save(&snapshot, CheckpointKind::Final)?;
        self.checkpoints.save(&snapshot, CheckpointKind::InProgress)?;
        let counts = snapshot.counts();
        self.write_metadata("completed", &counts);

        enter(&mut state, RunState::Done);
        info!(
            "Graph: {} nodes ({} assets, {} categories, {} explorers, {} exchanges), {} edges",
            counts.nodes(),
            counts.asset_nodes,
            counts.category_nodes,
            counts.explorer_nodes,
            counts.exchange_nodes,
            counts.edges()
        );
        Ok(RunOutcome::Completed { counts })
    }

    /// Resolve every category and union the results by asset id. An asset
    /// listed under several categories keeps the first one.
    async fn resolve_categories(&self) -> Result<Vec<AssetCandidate>, FetchError> {
        let resolver = CategoryResolver::new(&self.client, self.config.collection.page_delay());
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for category in &self.config.categories {
            let resolution = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!("Cancelled while resolving '{}'", category.label);
                    break;
                }
                resolution = resolver.resolve(
                    &category.label,
                    &category.aliases,
                    self.config.per_category_limit,
                ) => resolution?,
            };

            let assets = resolution.into_assets();
            let discovered = assets.len();
            let mut added = 0;
            for summary in assets {
                if seen.insert(summary.id.clone()) {
                    candidates.push(AssetCandidate {
                        summary,
                        category: category.label.clone(),
                    });
                    added += 1;
                }
            }
            info!(
                "Category '{}': {} assets discovered, {} new",
                category.label, discovered, added
            );
        }

        Ok(candidates)
    }

    /// Category nodes first, then whatever the last run left behind.
    fn restore(&self) -> Result<GraphAccumulator, CheckpointError> {
        let mut graph = GraphAccumulator::new();
        for category in &self.config.categories {
            graph.add_node(Node::category(&category.label));
        }

        let loaded = self.checkpoints.load()?;
        if !loaded.processed.is_empty() {
            info!("Resuming: {} assets already processed", loaded.processed.len());
        }
        graph.merge(loaded.snapshot);
        Ok(graph)
    }

    /// Returns `Ok(false)` when cancelled, including a cancel that arrived
    /// while categories were still resolving. An enrichment in flight at that
    /// moment is dropped and never reaches the graph.
    async fn process_assets(
        &self,
        candidates: &[AssetCandidate],
        aggregates: &Aggregates,
        graph: &mut GraphAccumulator,
    ) -> Result<bool, FetchError> {
        let enricher = DetailEnricher::new(
            &self.client,
            &self.config.wallets_by_chain,
            self.config.collection.include_tickers,
        );
        let pending: Vec<&AssetCandidate> = candidates
            .iter()
            .filter(|c| !graph.is_processed(&c.node_id()))
            .collect();
        info!(
            "{} assets to enrich, {} skipped from checkpoint",
            pending.len(),
            candidates.len() - pending.len()
        );

        if self.cancel.is_cancelled() {
            return Ok(false);
        }

        let progress_every = self.config.collection.progress_every.max(1);
        for (i, candidate) in pending.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }

            let enriched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(false),
                enriched = enricher.enrich(candidate, aggregates) => enriched?,
            };
            graph.apply(enriched);

            let done = i + 1;
            if done % progress_every == 0 {
                info!(
                    "Processed {}/{} assets ({} nodes, {} edges)",
                    done,
                    pending.len(),
                    graph.node_count(),
                    graph.edge_count()
                );
                if let Err(e) = self
                    .checkpoints
                    .save(&graph.snapshot(), CheckpointKind::InProgress)
                {
                    warn!("Failed to write progress checkpoint: {}", e);
                }
            }

            if done < pending.len() {
                let pause = self.config.collection.detail_pause();
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(false),
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        Ok(!self.cancel.is_cancelled())
    }

    fn write_metadata(&self, outcome: &str, counts: &RecordCounts) {
        let categories = self
            .config
            .categories
            .iter()
            .map(|c| c.label.clone())
            .collect();
        let metadata = RunMetadata::new(outcome, categories, counts.clone());
        let path = self.config.paths.metadata_dir.join("run_metadata.json");

        let result = std::fs::create_dir_all(&self.config.paths.metadata_dir)
            .map_err(anyhow::Error::from)
            .and_then(|_| metadata.save(&path));
        match result {
            Ok(()) => info!("Metadata saved to {:?}", path),
            Err(e) => warn!("Failed to write run metadata to {:?}: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CategoryConfig;
    use crate::graph::GraphSnapshot;
    use crate::schemas::{AssetAttributes, Edge, EdgeType};
    use crate::testutil::{detail_body, market_row, test_config};
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use wiremock::matchers::{path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn two_categories(base_url: &str, dir: &Path) -> PipelineConfig {
        let mut config = test_config(base_url, dir);
        config.categories = vec![
            CategoryConfig::new("Gaming", &["gaming"]),
            CategoryConfig::new("Memes", &["meme"]),
        ];
        config
    }

    async fn mount_markets(server: &MockServer, slug: &str, rows: serde_json::Value) {
        Mock::given(path("/coins/markets"))
            .and(query_param("category", slug))
            .respond_with(ResponseTemplate::new(200).set_body_json(rows))
            .mount(server)
            .await;
    }

    async fn mount_detail(server: &MockServer, id: &str, expect: u64) {
        Mock::given(path(format!("/coins/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(detail_body(id)))
            .expect(expect)
            .mount(server)
            .await;
    }

    fn checkpointed_asset(id: &str) -> (Node, Edge) {
        let node = Node::asset(
            format!("cg:{id}"),
            id.to_uppercase(),
            AssetAttributes {
                category: "Gaming".to_string(),
                ..Default::default()
            },
        );
        let edge = Edge::new(&node.node_id, "class:Gaming", EdgeType::AssetCategory, 0.1);
        (node, edge)
    }

    #[tokio::test]
    async fn test_full_run_writes_final_tables() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        mount_markets(
            &server,
            "gaming",
            json!([market_row("a", 60.0, 10.0, 1), market_row("b", 30.0, 5.0, 2)]),
        )
        .await;
        mount_markets(
            &server,
            "meme",
            json!([market_row("b", 30.0, 5.0, 2), market_row("c", 10.0, 1.0, 3)]),
        )
        .await;
        for id in ["a", "b", "c"] {
            mount_detail(&server, id, 1).await;
        }

        let config = two_categories(&server.uri(), dir.path());
        let collector = Collector::new(config, CancellationToken::new()).unwrap();
        let outcome = collector.run().await.unwrap();

        let expected = RecordCounts {
            asset_nodes: 3,
            category_nodes: 2,
            exchange_nodes: 0,
            explorer_nodes: 1,
            category_edges: 3,
            explorer_edges: 3,
            exchange_edges: 0,
        };
        assert_eq!(outcome, RunOutcome::Completed { counts: expected });

        let store = CheckpointStore::new(dir.path());
        let final_tables = store.read(CheckpointKind::Final).unwrap().unwrap();
        assert_eq!(final_tables.nodes[0].node_id, "class:Gaming");
        assert_eq!(final_tables.nodes[1].node_id, "class:Memes");

        let b = final_tables.nodes.iter().find(|n| n.node_id == "cg:b").unwrap();
        assert_eq!(b.asset.as_ref().unwrap().category, "Gaming");
        assert!(final_tables
            .edges
            .iter()
            .any(|e| e.src_id == "cg:b" && e.dst_id == "class:Gaming"));

        assert!(store.exists(CheckpointKind::InProgress));
        assert!(dir.path().join("metadata/run_metadata.json").exists());
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_assets() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        let (x, x_edge) = checkpointed_asset("x");
        let (y, y_edge) = checkpointed_asset("y");
        let before = GraphSnapshot {
            nodes: vec![Node::category("Gaming"), x, y],
            edges: vec![x_edge, y_edge],
        };
        CheckpointStore::new(dir.path())
            .save(&before, CheckpointKind::InProgress)
            .unwrap();

        mount_markets(
            &server,
            "gaming",
            json!([
                market_row("x", 5.0, 5.0, 1),
                market_row("y", 4.0, 4.0, 2),
                market_row("z", 3.0, 3.0, 3),
            ]),
        )
        .await;
        mount_markets(&server, "meme", json!([])).await;
        mount_detail(&server, "x", 0).await;
        mount_detail(&server, "y", 0).await;
        mount_detail(&server, "z", 1).await;

        let config = two_categories(&server.uri(), dir.path());
        let collector = Collector::new(config, CancellationToken::new()).unwrap();
        let outcome = collector.run().await.unwrap();

        let counts = outcome.counts();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(counts.asset_nodes, 3);
        assert_eq!(counts.category_edges, 3);
        assert!(counts.nodes() >= before.counts().nodes());
        assert!(counts.edges() >= before.counts().edges());
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_asset() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        mount_markets(
            &server,
            "gaming",
            json!([market_row("a", 60.0, 10.0, 1), market_row("b", 30.0, 5.0, 2)]),
        )
        .await;
        mount_markets(&server, "meme", json!([])).await;
        mount_detail(&server, "a", 1).await;
        Mock::given(path("/coins/b"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(detail_body("b"))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let config = two_categories(&server.uri(), dir.path());
        let collector = Collector::new(config, cancel).unwrap();
        let outcome = collector.run().await.unwrap();

        assert!(matches!(outcome, RunOutcome::Interrupted { .. }));
        assert_eq!(outcome.counts().asset_nodes, 1);

        let store = CheckpointStore::new(dir.path());
        assert!(!store.exists(CheckpointKind::Final));
        let loaded = store.load().unwrap();
        assert_eq!(loaded.processed, HashSet::from(["cg:a".to_string()]));
        assert!(loaded.snapshot.edges.iter().all(|e| e.src_id == "cg:a"));
    }

    #[tokio::test]
    async fn test_fatal_error_saves_progress_then_fails() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        mount_markets(
            &server,
            "gaming",
            json!([market_row("a", 60.0, 10.0, 1), market_row("b", 30.0, 5.0, 2)]),
        )
        .await;
        mount_markets(&server, "meme", json!([])).await;
        mount_detail(&server, "a", 1).await;
        Mock::given(path("/coins/b"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let config = two_categories(&server.uri(), dir.path());
        let collector = Collector::new(config, CancellationToken::new()).unwrap();
        let err = collector.run().await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Fetch(FetchError::ClientError { status: 401, .. })
        ));
        let loaded = CheckpointStore::new(dir.path()).load().unwrap();
        assert_eq!(loaded.processed, HashSet::from(["cg:a".to_string()]));
    }

    #[tokio::test]
    async fn test_cancel_while_resolving_keeps_final_tables() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(path("/coins/markets"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([market_row("a", 1.0, 1.0, 1)]))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
        mount_detail(&server, "a", 0).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let mut config = test_config(&server.uri(), dir.path());
        config.categories = vec![CategoryConfig::new("Gaming", &["gaming"])];
        let collector = Collector::new(config, cancel).unwrap();
        let outcome = collector.run().await.unwrap();

        assert!(matches!(outcome, RunOutcome::Interrupted { .. }));
        assert_eq!(outcome.counts().asset_nodes, 0);

        let store = CheckpointStore::new(dir.path());
        assert!(!store.exists(CheckpointKind::Final));
        assert!(store.exists(CheckpointKind::InProgress));
    }

    #[tokio::test]
    async fn test_cancel_during_pause_between_assets() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        mount_markets(
            &server,
            "gaming",
            json!([market_row("a", 60.0, 10.0, 1), market_row("b", 30.0, 5.0, 2)]),
        )
        .await;
        mount_markets(&server, "meme", json!([])).await;
        mount_detail(&server, "a", 1).await;
        mount_detail(&server, "b", 0).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let mut config = two_categories(&server.uri(), dir.path());
        config.collection.detail_sleep_secs = (30.0, 30.0);
        let collector = Collector::new(config, cancel).unwrap();
        let outcome = collector.run().await.unwrap();

        assert!(matches!(outcome, RunOutcome::Interrupted { .. }));
        let store = CheckpointStore::new(dir.path());
        assert!(!store.exists(CheckpointKind::Final));
        let loaded = store.load().unwrap();
        assert_eq!(loaded.processed, HashSet::from(["cg:a".to_string()]));
    }

    #[tokio::test]
    async fn test_progress_checkpoint_written_mid_run() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        mount_markets(
            &server,
            "gaming",
            json!([
                market_row("a", 60.0, 10.0, 1),
                market_row("b", 30.0, 5.0, 2),
                market_row("c", 10.0, 1.0, 3),
            ]),
        )
        .await;
        mount_markets(&server, "meme", json!([])).await;
        mount_detail(&server, "a", 1).await;
        mount_detail(&server, "b", 1).await;
        Mock::given(path("/coins/c"))
            .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_secs(5)))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = two_categories(&server.uri(), dir.path());
        config.collection.progress_every = 1;
        let collector = Collector::new(config, CancellationToken::new()).unwrap();
        let run = tokio::spawn(async move { collector.run().await });

        // While `c` is pending only the periodic saves can have written the tables
        let store = CheckpointStore::new(dir.path());
        let mut processed = HashSet::new();
        for _ in 0..15 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if store.exists(CheckpointKind::InProgress) {
                processed = store.load().unwrap().processed;
                if processed.len() == 2 {
                    break;
                }
            }
        }
        assert_eq!(
            processed,
            HashSet::from(["cg:a".to_string(), "cg:b".to_string()])
        );
        assert!(!run.is_finished());

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Fetch(FetchError::ClientError { status: 401, .. })
        ));
        assert_eq!(store.load().unwrap().processed.len(), 2);
        assert!(!store.exists(CheckpointKind::Final));
    }
}
