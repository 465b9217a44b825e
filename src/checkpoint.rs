//! Checkpoint persistence for the node and edge tables.
//!
//! Both tables are CSV files under the data directory. The in-progress pair
//! (`nodes_tmp.csv`, `edges_tmp.csv`) is what a resumed run loads; the final
//! pair (`nodes.csv`, `edges.csv`) is written once a run completes. Every write
//! goes to a `.part` file that is synced and renamed into place, so a reader
//! never observes a half-written table.
//!
//! List-valued node fields are JSON arrays in the files. Tables written by the
//! older collector (letter type codes, Python list literals, `True`/`False`,
//! a `weight_pr` column) are still readable.

use crate::graph::GraphSnapshot;
use crate::schemas::{AssetAttributes, Edge, EdgeType, Node, NodeType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid row in {file:?}: {reason}")]
    InvalidRow { file: PathBuf, reason: String },
}

/// Which pair of tables to read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Partial progress, loaded on resume
    InProgress,
    /// Artifact of a completed run
    Final,
}

impl CheckpointKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            CheckpointKind::InProgress => "_tmp",
            CheckpointKind::Final => "",
        }
    }
}

/// State recovered from a previous run
#[derive(Debug, Clone, Default)]
pub struct LoadedCheckpoint {
    pub snapshot: GraphSnapshot,
    /// Asset node ids whose node and category edge were both recorded
    pub processed: HashSet<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRow {
    node_id: String,
    node_type: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    market_cap: Option<String>,
    #[serde(default)]
    volume_24h: Option<String>,
    #[serde(default)]
    rank: Option<String>,
    #[serde(default)]
    is_multichain: Option<String>,
    #[serde(default)]
    chain_platforms: Option<String>,
    #[serde(default)]
    main_contract: Option<String>,
    #[serde(default)]
    links_explorers: Option<String>,
    #[serde(default)]
    wallets_inferred: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeRow {
    src_id: String,
    dst_id: String,
    edge_type: String,
    #[serde(alias = "weight_pr")]
    weight: f64,
    #[serde(default)]
    reasons: Option<String>,
}

fn encode_list(values: &[String]) -> Option<String> {
    serde_json::to_string(values).ok()
}

fn decode_list(raw: Option<&str>) -> Vec<String> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Vec::new();
    }
    let values = serde_json::from_str::<Vec<String>>(raw)
        // Python list literal, e.g. ['MetaMask', 'Trust Wallet']
        .or_else(|_| serde_json::from_str::<Vec<String>>(&raw.replace('\'', "\"")))
        .unwrap_or_else(|_| {
            warn!("Unreadable list field {:?}, treating as empty", raw);
            Vec::new()
        });
    values.into_iter().filter(|v| !v.trim().is_empty()).collect()
}

fn decode_f64(raw: Option<&str>) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn decode_rank(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u32)
}

fn decode_bool(raw: Option<&str>) -> bool {
    matches!(
        raw.map(str::trim),
        Some("true") | Some("True") | Some("TRUE") | Some("1")
    )
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.filter(|s| !s.trim().is_empty())
}

impl From<&Node> for NodeRow {
    fn from(node: &Node) -> Self {
        let mut row = NodeRow {
            node_id: node.node_id.clone(),
            node_type: node.node_type.to_string(),
            name: Some(node.name.clone()),
            symbol: None,
            category: None,
            market_cap: None,
            volume_24h: None,
            rank: None,
            is_multichain: None,
            chain_platforms: None,
            main_contract: None,
            links_explorers: None,
            wallets_inferred: None,
        };
        if let Some(asset) = &node.asset {
            row.symbol = Some(asset.symbol.clone());
            row.category = Some(asset.category.clone());
            row.market_cap = Some(asset.market_cap.to_string());
            row.volume_24h = Some(asset.volume_24h.to_string());
            row.rank = asset.rank.map(|r| r.to_string());
            row.is_multichain = Some(asset.is_multichain.to_string());
            row.chain_platforms = encode_list(&asset.chain_platforms);
            row.main_contract = asset.main_contract.clone();
            row.links_explorers = encode_list(&asset.links_explorers);
            row.wallets_inferred = encode_list(&asset.wallets_inferred);
        }
        row
    }
}

impl NodeRow {
    fn into_node(self) -> Result<Node, String> {
        let node_type: NodeType = self.node_type.parse()?;
        let name = self.name.unwrap_or_default();

        let asset = (node_type == NodeType::Asset).then(|| AssetAttributes {
            symbol: self.symbol.clone().unwrap_or_default(),
            category: self.category.clone().unwrap_or_default(),
            market_cap: decode_f64(self.market_cap.as_deref()),
            volume_24h: decode_f64(self.volume_24h.as_deref()),
            rank: decode_rank(self.rank.as_deref()),
            is_multichain: decode_bool(self.is_multichain.as_deref()),
            chain_platforms: decode_list(self.chain_platforms.as_deref()),
            main_contract: non_empty(self.main_contract.clone()),
            links_explorers: decode_list(self.links_explorers.as_deref()),
            wallets_inferred: decode_list(self.wallets_inferred.as_deref()),
        });

        Ok(Node {
            node_id: self.node_id,
            node_type,
            name,
            asset,
        })
    }
}

impl From<&Edge> for EdgeRow {
    fn from(edge: &Edge) -> Self {
        EdgeRow {
            src_id: edge.src_id.clone(),
            dst_id: edge.dst_id.clone(),
            edge_type: edge.edge_type.to_string(),
            weight: edge.weight,
            reasons: Some(edge.reason.clone()),
        }
    }
}

impl EdgeRow {
    fn into_edge(self) -> Result<Edge, String> {
        let edge_type: EdgeType = self.edge_type.parse()?;
        Ok(Edge {
            src_id: self.src_id,
            dst_id: self.dst_id,
            edge_type,
            weight: self.weight.clamp(0.0, 1.0),
            reason: self
                .reasons
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| edge_type.reason().to_string()),
        })
    }
}

/// Reads and writes the node/edge tables under one directory
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn nodes_path(&self, kind: CheckpointKind) -> PathBuf {
        self.dir.join(format!("nodes{}.csv", kind.suffix()))
    }

    pub fn edges_path(&self, kind: CheckpointKind) -> PathBuf {
        self.dir.join(format!("edges{}.csv", kind.suffix()))
    }

    pub fn exists(&self, kind: CheckpointKind) -> bool {
        self.nodes_path(kind).exists()
    }

    /// Load in-progress state, if any. Asset nodes without their category edge
    /// are discarded so they are collected again.
    pub fn load(&self) -> Result<LoadedCheckpoint, CheckpointError> {
        let snapshot = match self.read(CheckpointKind::InProgress)? {
            Some(snapshot) => snapshot.deduplicated().drop_incomplete_assets(),
            None => return Ok(LoadedCheckpoint::default()),
        };
        let processed = snapshot.complete_asset_ids();

        info!(
            "Loaded checkpoint: {} nodes, {} edges, {} assets already processed",
            snapshot.nodes.len(),
            snapshot.edges.len(),
            processed.len()
        );
        Ok(LoadedCheckpoint {
            snapshot,
            processed,
        })
    }

    /// Read one pair of tables. `None` when the node table does not exist.
    pub fn read(&self, kind: CheckpointKind) -> Result<Option<GraphSnapshot>, CheckpointError> {
        let nodes_path = self.nodes_path(kind);
        if !nodes_path.exists() {
            return Ok(None);
        }

        let mut nodes = Vec::new();
        let mut reader = csv::Reader::from_path(&nodes_path)?;
        for row in reader.deserialize::<NodeRow>() {
            let node = row?.into_node().map_err(|reason| CheckpointError::InvalidRow {
                file: nodes_path.clone(),
                reason,
            })?;
            nodes.push(node);
        }

        let edges_path = self.edges_path(kind);
        let mut edges = Vec::new();
        if edges_path.exists() {
            let mut reader = csv::Reader::from_path(&edges_path)?;
            for row in reader.deserialize::<EdgeRow>() {
                let edge = row?.into_edge().map_err(|reason| CheckpointError::InvalidRow {
                    file: edges_path.clone(),
                    reason,
                })?;
                edges.push(edge);
            }
        } else {
            warn!("{:?} exists without {:?}", nodes_path, edges_path);
        }

        Ok(Some(GraphSnapshot { nodes, edges }))
    }

    /// Write both tables atomically.
    pub fn save(&self, snapshot: &GraphSnapshot, kind: CheckpointKind) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;

        let nodes_path = self.nodes_path(kind);
        let edges_path = self.edges_path(kind);
        write_atomic(&nodes_path, snapshot.nodes.iter().map(NodeRow::from))?;
        write_atomic(&edges_path, snapshot.edges.iter().map(EdgeRow::from))?;

        info!(
            "Saved {} nodes to {:?} and {} edges to {:?}",
            snapshot.nodes.len(),
            nodes_path,
            snapshot.edges.len(),
            edges_path
        );
        Ok(())
    }
}

fn write_atomic<R: Serialize>(
    path: &Path,
    rows: impl Iterator<Item = R>,
) -> Result<(), CheckpointError> {
    let part = path.with_extension("csv.part");
    {
        let mut writer = csv::Writer::from_writer(File::create(&part)?);
        for row in rows {
            writer.serialize(row)?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| CheckpointError::Io(e.into_error()))?;
        file.sync_all()?;
    }
    std::fs::rename(&part, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> GraphSnapshot {
        let asset = Node::asset(
            "cg:axie".to_string(),
            "Axie Infinity".to_string(),
            AssetAttributes {
                symbol: "axs".to_string(),
                category: "Gaming".to_string(),
                market_cap: 1_500_000.5,
                volume_24h: 20_000.0,
                rank: Some(42),
                is_multichain: true,
                chain_platforms: vec!["ethereum".into(), "ronin".into()],
                main_contract: Some("0xbb0e".to_string()),
                links_explorers: vec!["etherscan.io".into()],
                wallets_inferred: vec!["MetaMask".into(), "Trust Wallet".into()],
            },
        );
        GraphSnapshot {
            nodes: vec![Node::category("Gaming"), asset, Node::explorer("etherscan.io")],
            edges: vec![
                Edge::new("cg:axie", "class:Gaming", EdgeType::AssetCategory, 0.25),
                Edge::new("cg:axie", "exp:etherscan.io", EdgeType::AssetExplorer, 0.25),
            ],
        }
    }

    #[test]
    fn test_save_then_load_preserves_typed_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let snapshot = sample_snapshot();

        store.save(&snapshot, CheckpointKind::InProgress).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.snapshot, snapshot);
        assert_eq!(loaded.processed, HashSet::from(["cg:axie".to_string()]));
        assert!(!dir.path().join("nodes_tmp.csv.part").exists());
        assert!(!store.exists(CheckpointKind::Final));
    }

    #[test]
    fn test_final_and_in_progress_are_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.save(&sample_snapshot(), CheckpointKind::Final).unwrap();

        assert!(dir.path().join("nodes.csv").exists());
        assert!(dir.path().join("edges.csv").exists());
        assert!(store.load().unwrap().processed.is_empty());
    }

    #[test]
    fn test_missing_checkpoint_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = CheckpointStore::new(dir.path()).load().unwrap();
        assert!(loaded.snapshot.nodes.is_empty());
        assert!(loaded.processed.is_empty());
    }

    #[test]
    fn test_reads_legacy_tables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("nodes_tmp.csv"),
            "node_id,node_type,name,symbol,category,market_cap,volume_24h,rank,is_multichain,chain_platforms,main_contract,links_explorers,wallets_inferred\n\
             cg:doge,A,Dogecoin,doge,Memes,100.0,50.0,8.0,False,\"['']\",,\"['dogechain.info']\",[]\n\
             class:Memes,B,Memes,,,,,,,,,,\n\
             exp:dogechain.info,D,dogechain.info,,,,,,,,,,\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("edges_tmp.csv"),
            "src_id,dst_id,edge_type,weight_pr,reasons\n\
             cg:doge,class:Memes,A-B,0.5,pertenece a categoria\n\
             cg:doge,exp:dogechain.info,A-D,0.5,explorador asociado\n",
        )
        .unwrap();

        let loaded = CheckpointStore::new(dir.path()).load().unwrap();

        assert!(loaded.processed.contains("cg:doge"));
        let doge = &loaded.snapshot.nodes[0];
        let attrs = doge.asset.as_ref().unwrap();
        assert_eq!(attrs.rank, Some(8));
        assert!(!attrs.is_multichain);
        assert_eq!(attrs.main_contract, None);
        assert!(attrs.chain_platforms.is_empty());
        assert_eq!(attrs.links_explorers, vec!["dogechain.info"]);
        assert_eq!(loaded.snapshot.edges[0].edge_type, EdgeType::AssetCategory);
        assert_eq!(loaded.snapshot.edges[1].weight, 0.5);
    }

    #[test]
    fn test_asset_without_category_edge_is_not_processed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut snapshot = sample_snapshot();
        snapshot.edges.retain(|e| e.edge_type != EdgeType::AssetCategory);

        store.save(&snapshot, CheckpointKind::InProgress).unwrap();
        let loaded = store.load().unwrap();

        assert!(loaded.processed.is_empty());
        assert!(loaded.snapshot.nodes.iter().all(|n| !n.is_asset()));
        assert!(loaded.snapshot.edges.is_empty());
    }

    #[test]
    fn test_unknown_node_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("nodes_tmp.csv"),
            "node_id,node_type,name\nx:1,Z,bad\n",
        )
        .unwrap();

        let err = CheckpointStore::new(dir.path()).load().unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidRow { .. }));
    }
}
