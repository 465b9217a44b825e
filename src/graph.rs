//! In-memory graph accumulation.
//!
//! Nodes and edges are kept in insertion order with hash indexes for
//! idempotent insertion: a node id or `(src, dst, type)` edge key seen once is
//! never added again, so the first-seen record wins.

use crate::enrich::EnrichedAsset;
use crate::schemas::{Edge, EdgeKey, EdgeType, Node, NodeType, RecordCounts};
use std::collections::HashSet;
use tracing::warn;

/// A plain node/edge listing, as loaded from or saved to the tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    /// Keep the first node per id and the first edge per key.
    pub fn deduplicated(self) -> Self {
        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        Self {
            nodes: self
                .nodes
                .into_iter()
                .filter(|n| ids.insert(n.node_id.clone()))
                .collect(),
            edges: self.edges.into_iter().filter(|e| keys.insert(e.key())).collect(),
        }
    }

    pub fn counts(&self) -> RecordCounts {
        RecordCounts::from_graph(&self.nodes, &self.edges)
    }

    /// Asset ids whose node and category edge are both present.
    pub fn complete_asset_ids(&self) -> HashSet<String> {
        let categorized: HashSet<&str> = self
            .edges
            .iter()
            .filter(|e| e.edge_type == EdgeType::AssetCategory)
            .map(|e| e.src_id.as_str())
            .collect();

        self.nodes
            .iter()
            .filter(|n| n.is_asset() && n.asset.is_some())
            .filter(|n| categorized.contains(n.node_id.as_str()))
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// Remove asset nodes that are not complete, and every edge they own, so
    /// the asset is fetched again instead of being treated as done.
    pub fn drop_incomplete_assets(mut self) -> Self {
        let complete = self.complete_asset_ids();
        let incomplete: HashSet<String> = self
            .nodes
            .iter()
            .filter(|n| n.is_asset() && !complete.contains(&n.node_id))
            .map(|n| n.node_id.clone())
            .collect();

        // Edges whose source asset node is missing entirely are orphans too
        let asset_ids: HashSet<&str> = self
            .nodes
            .iter()
            .filter(|n| n.is_asset())
            .map(|n| n.node_id.as_str())
            .collect();
        let orphan_sources: HashSet<String> = self
            .edges
            .iter()
            .filter(|e| !asset_ids.contains(e.src_id.as_str()))
            .map(|e| e.src_id.clone())
            .collect();

        if !incomplete.is_empty() || !orphan_sources.is_empty() {
            warn!(
                "Discarding {} incomplete asset nodes and edges of {} missing assets; they will be refetched",
                incomplete.len(),
                orphan_sources.len()
            );
        }

        self.nodes.retain(|n| !incomplete.contains(&n.node_id));
        self.edges
            .retain(|e| !incomplete.contains(&e.src_id) && !orphan_sources.contains(&e.src_id));
        self
    }
}

/// Deduplicating node/edge accumulator for one run
#[derive(Debug, Default)]
pub struct GraphAccumulator {
    nodes: Vec<Node>,
    node_ids: HashSet<String>,
    edges: Vec<Edge>,
    edge_keys: HashSet<EdgeKey>,
    processed: HashSet<String>,
}

impl GraphAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node unless its id is already present. Returns whether it was added.
    pub fn add_node(&mut self, node: Node) -> bool {
        if !self.node_ids.insert(node.node_id.clone()) {
            return false;
        }
        self.nodes.push(node);
        true
    }

    /// Insert an edge unless its `(src, dst, type)` key is already present.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if !self.edge_keys.insert(edge.key()) {
            return false;
        }
        self.edges.push(edge);
        true
    }

    /// Merge previously persisted state. Complete asset nodes become processed.
    pub fn merge(&mut self, snapshot: GraphSnapshot) {
        let complete = snapshot.complete_asset_ids();
        for node in snapshot.nodes {
            self.add_node(node);
        }
        for edge in snapshot.edges {
            self.add_edge(edge);
        }
        self.processed.extend(complete);
    }

    /// Apply one asset's contribution. Linked nodes and edges go in first and
    /// the asset node last, then the asset is marked processed.
    pub fn apply(&mut self, enriched: EnrichedAsset) {
        let asset_id = enriched.asset.node_id.clone();
        for node in enriched.linked {
            self.add_node(node);
        }
        for edge in enriched.edges {
            self.add_edge(edge);
        }
        self.add_node(enriched.asset);
        self.processed.insert(asset_id);
    }

    pub fn is_processed(&self, asset_node_id: &str) -> bool {
        self.processed.contains(asset_node_id)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }

    /// Copy of the current state, for checkpointing mid-run.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }

    /// Final dedup pass; returns the clean node and edge sets.
    pub fn finalize(self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes,
            edges: self.edges,
        }
        .deduplicated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::AssetAttributes;

    fn asset(id: &str, name: &str) -> Node {
        Node::asset(
            format!("cg:{id}"),
            name.to_string(),
            AssetAttributes {
                category: "Gaming".to_string(),
                ..Default::default()
            },
        )
    }

    fn enriched(id: &str, explorers: &[&str]) -> EnrichedAsset {
        let node_id = format!("cg:{id}");
        let mut edges = vec![Edge::new(&node_id, "class:Gaming", EdgeType::AssetCategory, 0.3)];
        let mut linked = Vec::new();
        for host in explorers {
            let node = Node::explorer(host);
            edges.push(Edge::new(&node_id, &node.node_id, EdgeType::AssetExplorer, 0.3));
            linked.push(node);
        }
        EnrichedAsset {
            asset: asset(id, id),
            linked,
            edges,
            weight: 0.3,
        }
    }

    #[test]
    fn test_add_node_first_seen_wins() {
        let mut graph = GraphAccumulator::new();
        assert!(graph.add_node(asset("x", "first")));
        assert!(!graph.add_node(asset("x", "second")));

        let snapshot = graph.finalize();
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].name, "first");
    }

    #[test]
    fn test_edge_identity_ignores_weight() {
        let mut graph = GraphAccumulator::new();
        assert!(graph.add_edge(Edge::new("cg:x", "class:A", EdgeType::AssetCategory, 0.1)));
        assert!(!graph.add_edge(Edge::new("cg:x", "class:A", EdgeType::AssetCategory, 0.9)));
        assert!(graph.add_edge(Edge::new("cg:x", "class:A", EdgeType::AssetExplorer, 0.1)));
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_apply_shares_explorer_nodes() {
        let mut graph = GraphAccumulator::new();
        graph.add_node(Node::category("Gaming"));
        graph.apply(enriched("a", &["etherscan.io"]));
        graph.apply(enriched("b", &["etherscan.io", "bscscan.com"]));

        assert!(graph.is_processed("cg:a"));
        assert!(graph.is_processed("cg:b"));
        assert_eq!(graph.nodes_of_type(NodeType::Explorer).count(), 2);

        let snapshot = graph.finalize();
        let counts = snapshot.counts();
        assert_eq!(counts.asset_nodes, 2);
        assert_eq!(counts.category_edges, 2);
        assert_eq!(counts.explorer_edges, 3);
        assert_eq!(snapshot.nodes.len(), 5);
    }

    #[test]
    fn test_merge_marks_only_complete_assets_processed() {
        let mut loaded = GraphSnapshot::default();
        loaded.nodes.push(asset("done", "done"));
        loaded
            .edges
            .push(Edge::new("cg:done", "class:Gaming", EdgeType::AssetCategory, 0.2));
        loaded.nodes.push(asset("partial", "partial"));

        let mut graph = GraphAccumulator::new();
        graph.merge(loaded);

        assert!(graph.is_processed("cg:done"));
        assert!(!graph.is_processed("cg:partial"));
        assert_eq!(graph.processed_count(), 1);
    }

    #[test]
    fn test_drop_incomplete_assets() {
        let snapshot = GraphSnapshot {
            nodes: vec![asset("done", "done"), asset("partial", "partial"), Node::explorer("e.io")],
            edges: vec![
                Edge::new("cg:done", "class:Gaming", EdgeType::AssetCategory, 0.2),
                Edge::new("cg:partial", "exp:e.io", EdgeType::AssetExplorer, 0.2),
                Edge::new("cg:ghost", "class:Gaming", EdgeType::AssetCategory, 0.2),
            ],
        }
        .drop_incomplete_assets();

        let ids: Vec<_> = snapshot.nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["cg:done", "exp:e.io"]);
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].src_id, "cg:done");
    }

    #[test]
    fn test_deduplicated_snapshot_has_unique_ids_and_keys() {
        let snapshot = GraphSnapshot {
            nodes: vec![Node::category("A"), Node::category("A"), Node::explorer("x")],
            edges: vec![
                Edge::new("cg:1", "class:A", EdgeType::AssetCategory, 0.1),
                Edge::new("cg:1", "class:A", EdgeType::AssetCategory, 0.2),
            ],
        }
        .deduplicated();

        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].weight, 0.1);
    }
}
