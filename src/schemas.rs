//! Data schemas for the asset graph.
//!
//! This module is the canonical definition of the node and edge types shared by
//! the enricher, the accumulator and the checkpoint store. Nodes are fully typed
//! in memory; list-valued fields are only flattened to text in
//! [`crate::checkpoint`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Schema version for tracking changes
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Namespace prefixes for node ids
pub const ASSET_PREFIX: &str = "cg:";
pub const CATEGORY_PREFIX: &str = "class:";
pub const EXCHANGE_PREFIX: &str = "cex:";
pub const EXPLORER_PREFIX: &str = "exp:";

pub fn asset_node_id(coin_id: &str) -> String {
    format!("{ASSET_PREFIX}{coin_id}")
}

pub fn category_node_id(label: &str) -> String {
    format!("{CATEGORY_PREFIX}{label}")
}

pub fn exchange_node_id(exchange: &str) -> String {
    format!("{EXCHANGE_PREFIX}{exchange}")
}

pub fn explorer_node_id(host: &str) -> String {
    format!("{EXPLORER_PREFIX}{host}")
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// A cryptocurrency or token
    Asset,
    /// A configured thematic class
    Category,
    /// A centralized trading venue
    Exchange,
    /// A block-explorer host
    Explorer,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Asset => write!(f, "asset"),
            NodeType::Category => write!(f, "category"),
            NodeType::Exchange => write!(f, "exchange"),
            NodeType::Explorer => write!(f, "explorer"),
        }
    }
}

impl FromStr for NodeType {
    type Err = String;

    /// Accepts the current names and the single-letter codes of older tables.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "asset" | "A" => Ok(NodeType::Asset),
            "category" | "B" => Ok(NodeType::Category),
            "exchange" | "C" => Ok(NodeType::Exchange),
            "explorer" | "D" => Ok(NodeType::Explorer),
            other => Err(format!("unknown node type '{other}'")),
        }
    }
}

/// Attributes carried only by asset nodes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssetAttributes {
    pub symbol: String,

    /// Label of the category that first listed this asset
    pub category: String,

    pub market_cap: f64,

    pub volume_24h: f64,

    /// Market-cap rank, absent for unranked assets
    pub rank: Option<u32>,

    /// More than one non-empty platform key
    pub is_multichain: bool,

    /// Platform keys in API order
    pub chain_platforms: Vec<String>,

    /// First non-empty platform contract address
    pub main_contract: Option<String>,

    /// Explorer hosts, first-seen order
    pub links_explorers: Vec<String>,

    /// Sorted, deduplicated wallet names
    pub wallets_inferred: Vec<String>,
}

/// A graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_type: NodeType,
    pub name: String,
    /// Present iff `node_type == Asset`
    pub asset: Option<AssetAttributes>,
}

impl Node {
    pub fn asset(node_id: String, name: String, attributes: AssetAttributes) -> Self {
        Self {
            node_id,
            node_type: NodeType::Asset,
            name,
            asset: Some(attributes),
        }
    }

    pub fn category(label: &str) -> Self {
        Self::named(category_node_id(label), NodeType::Category, label)
    }

    pub fn exchange(exchange: &str) -> Self {
        Self::named(exchange_node_id(exchange), NodeType::Exchange, exchange)
    }

    pub fn explorer(host: &str) -> Self {
        Self::named(explorer_node_id(host), NodeType::Explorer, host)
    }

    fn named(node_id: String, node_type: NodeType, name: &str) -> Self {
        Self {
            node_id,
            node_type,
            name: name.to_string(),
            asset: None,
        }
    }

    pub fn is_asset(&self) -> bool {
        self.node_type == NodeType::Asset
    }
}

// ============================================================================
// Edges
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EdgeType {
    #[serde(rename = "asset-category")]
    AssetCategory,
    #[serde(rename = "asset-explorer")]
    AssetExplorer,
    #[serde(rename = "asset-exchange")]
    AssetExchange,
}

impl EdgeType {
    /// Human-readable reason stored with every edge of this type
    pub fn reason(&self) -> &'static str {
        match self {
            EdgeType::AssetCategory => "belongs to category",
            EdgeType::AssetExplorer => "associated explorer",
            EdgeType::AssetExchange => "listed on exchange",
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeType::AssetCategory => write!(f, "asset-category"),
            EdgeType::AssetExplorer => write!(f, "asset-explorer"),
            EdgeType::AssetExchange => write!(f, "asset-exchange"),
        }
    }
}

impl FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "asset-category" | "A-B" => Ok(EdgeType::AssetCategory),
            "asset-explorer" | "A-D" => Ok(EdgeType::AssetExplorer),
            "asset-exchange" | "A-C" => Ok(EdgeType::AssetExchange),
            other => Err(format!("unknown edge type '{other}'")),
        }
    }
}

/// A weighted, typed edge from an asset to another node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub src_id: String,
    pub dst_id: String,
    pub edge_type: EdgeType,
    /// Asset weight in [0, 1]
    pub weight: f64,
    pub reason: String,
}

/// Identity of an edge for deduplication
pub type EdgeKey = (String, String, EdgeType);

impl Edge {
    pub fn new(src_id: &str, dst_id: &str, edge_type: EdgeType, weight: f64) -> Self {
        Self {
            src_id: src_id.to_string(),
            dst_id: dst_id.to_string(),
            edge_type,
            weight,
            reason: edge_type.reason().to_string(),
        }
    }

    pub fn key(&self) -> EdgeKey {
        (self.src_id.clone(), self.dst_id.clone(), self.edge_type)
    }
}

// ============================================================================
// Metadata Schema
// ============================================================================

/// Run metadata for reproducibility and auditing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Schema version used
    pub schema_version: String,

    /// Pipeline run timestamp
    pub run_timestamp: DateTime<Utc>,

    /// "completed", "interrupted" or "exchange-backfill"
    pub outcome: String,

    /// Configured category labels
    pub categories: Vec<String>,

    /// Record counts by type
    pub record_counts: RecordCounts,

    /// Git commit hash (if available)
    pub git_commit: Option<String>,

    /// Pipeline version
    pub pipeline_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub asset_nodes: usize,
    pub category_nodes: usize,
    pub exchange_nodes: usize,
    pub explorer_nodes: usize,
    pub category_edges: usize,
    pub explorer_edges: usize,
    pub exchange_edges: usize,
}

impl RecordCounts {
    pub fn from_graph(nodes: &[Node], edges: &[Edge]) -> Self {
        let mut counts = Self::default();
        for node in nodes {
            match node.node_type {
                NodeType::Asset => counts.asset_nodes += 1,
                NodeType::Category => counts.category_nodes += 1,
                NodeType::Exchange => counts.exchange_nodes += 1,
                NodeType::Explorer => counts.explorer_nodes += 1,
            }
        }
        for edge in edges {
            match edge.edge_type {
                EdgeType::AssetCategory => counts.category_edges += 1,
                EdgeType::AssetExplorer => counts.explorer_edges += 1,
                EdgeType::AssetExchange => counts.exchange_edges += 1,
            }
        }
        counts
    }

    pub fn nodes(&self) -> usize {
        self.asset_nodes + self.category_nodes + self.exchange_nodes + self.explorer_nodes
    }

    pub fn edges(&self) -> usize {
        self.category_edges + self.explorer_edges + self.exchange_edges
    }
}

impl RunMetadata {
    pub fn new(outcome: &str, categories: Vec<String>, record_counts: RecordCounts) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_timestamp: Utc::now(),
            outcome: outcome.to_string(),
            categories,
            record_counts,
            git_commit: get_git_commit(),
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn get_git_commit() -> Option<String> {
    std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
}
