//! Per-asset detail enrichment.
//!
//! Fetches `/coins/{id}` for one asset and derives everything the graph needs
//! from it: explorer hosts, inferred wallets, the multichain flag, the primary
//! contract, optional exchange listings, and the asset weight shared by every
//! edge emitted for the asset.

use crate::category::MarketSummary;
use crate::client::{ApiClient, FetchError};
use crate::schemas::{
    asset_node_id, category_node_id, AssetAttributes, Edge, EdgeType, Node,
};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// Treat an explicit JSON `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Subset of `/coins/{id}` used by the enricher
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoinDetail {
    #[serde(default)]
    pub id: String,

    /// Chain platform -> contract address, in API order
    #[serde(default, deserialize_with = "null_as_default")]
    pub platforms: serde_json::Map<String, serde_json::Value>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub links: Links,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tickers: Vec<Ticker>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Links {
    #[serde(default, deserialize_with = "null_as_default")]
    pub blockchain_site: Vec<Option<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ticker {
    #[serde(default)]
    pub market: Option<TickerMarket>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TickerMarket {
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Global normalization values, computed once per run over the whole
/// deduplicated asset universe.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Aggregates {
    pub total_market_cap: f64,
    pub max_volume_24h: f64,
}

impl Aggregates {
    pub fn from_values(values: impl IntoIterator<Item = (f64, f64)>) -> Self {
        values
            .into_iter()
            .fold(Self::default(), |acc, (market_cap, volume)| Self {
                total_market_cap: acc.total_market_cap + market_cap.max(0.0),
                max_volume_24h: acc.max_volume_24h.max(volume),
            })
    }

    pub fn from_candidates(candidates: &[AssetCandidate]) -> Self {
        Self::from_values(
            candidates
                .iter()
                .map(|c| (c.summary.market_cap.unwrap_or(0.0), c.summary.total_volume.unwrap_or(0.0))),
        )
    }
}

/// An asset selected for processing, with the category that first listed it
#[derive(Debug, Clone, PartialEq)]
pub struct AssetCandidate {
    pub summary: MarketSummary,
    pub category: String,
}

impl AssetCandidate {
    pub fn node_id(&self) -> String {
        asset_node_id(&self.summary.id)
    }
}

/// Everything one asset contributes to the graph
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedAsset {
    pub asset: Node,
    /// Explorer and exchange nodes referenced by `edges`
    pub linked: Vec<Node>,
    pub edges: Vec<Edge>,
    pub weight: f64,
}

/// `sqrt(market cap share) * sqrt(normalized volume)`, always in [0, 1].
pub fn weight_score(market_cap: f64, volume_24h: f64, aggregates: &Aggregates) -> f64 {
    let share = if aggregates.total_market_cap > 0.0 {
        market_cap.max(0.0) / aggregates.total_market_cap
    } else {
        0.0
    };
    let volume_norm = if aggregates.max_volume_24h > 0.0 {
        volume_24h.max(0.0) / aggregates.max_volume_24h
    } else {
        0.0
    };
    (share.sqrt() * volume_norm.sqrt()).clamp(0.0, 1.0)
}

/// Explorer hosts from `links.blockchain_site`: empty entries dropped,
/// first-seen order kept, no repeats.
pub fn normalize_explorers<'a>(sites: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();
    for site in sites.into_iter().map(str::trim).filter(|s| !s.is_empty()) {
        let host = explorer_host(site);
        if !host.is_empty() && seen.insert(host.clone()) {
            hosts.push(host);
        }
    }
    hosts
}

/// Authority of `site` exactly as written, port and case included. Entries
/// without a scheme are taken whole.
fn explorer_host(site: &str) -> String {
    match site.split_once("://") {
        Some((_, rest)) => rest.split('/').next().unwrap_or_default().to_string(),
        None => site.to_string(),
    }
}

/// Non-empty platform keys, in API order
pub fn platform_keys(platforms: &serde_json::Map<String, serde_json::Value>) -> Vec<String> {
    platforms
        .keys()
        .filter(|k| !k.trim().is_empty())
        .cloned()
        .collect()
}

/// First non-empty contract address
pub fn main_contract(platforms: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    platforms
        .values()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|addr| !addr.is_empty())
        .map(str::to_string)
}

/// Union of wallets supporting any of the asset's platforms, sorted.
pub fn infer_wallets(
    platforms: &serde_json::Map<String, serde_json::Value>,
    wallets_by_chain: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    platform_keys(platforms)
        .iter()
        .filter_map(|chain| wallets_by_chain.get(chain))
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Exchange identifiers from tickers, sorted and deduplicated. Falls back to
/// market display names when no ticker carries an identifier.
pub fn exchange_listings(tickers: &[Ticker]) -> Vec<String> {
    let collect = |pick: fn(&TickerMarket) -> Option<&String>| -> BTreeSet<String> {
        tickers
            .iter()
            .filter_map(|t| t.market.as_ref())
            .filter_map(pick)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };

    let identifiers = collect(|m| m.identifier.as_ref());
    let exchanges = if identifiers.is_empty() {
        collect(|m| m.name.as_ref())
    } else {
        identifiers
    };
    exchanges.into_iter().collect()
}

/// GET `/coins/{id}`
pub async fn fetch_coin_detail(
    client: &ApiClient,
    coin_id: &str,
    tickers: bool,
    market_data: bool,
) -> Result<CoinDetail, FetchError> {
    let query = [
        ("localization", "false".to_string()),
        ("tickers", tickers.to_string()),
        ("market_data", market_data.to_string()),
        ("community_data", "false".to_string()),
        ("developer_data", "false".to_string()),
        ("sparkline", "false".to_string()),
    ];
    client.fetch_json(&format!("coins/{coin_id}"), &query).await
}

/// Exchange nodes and edges for one asset
pub fn exchange_links(asset_id: &str, exchanges: &[String], weight: f64) -> (Vec<Node>, Vec<Edge>) {
    exchanges
        .iter()
        .map(|ex| {
            let node = Node::exchange(ex);
            let edge = Edge::new(asset_id, &node.node_id, EdgeType::AssetExchange, weight);
            (node, edge)
        })
        .unzip()
}

/// Assemble the graph contribution of one asset from its detail record.
pub fn build_enriched_asset(
    candidate: &AssetCandidate,
    detail: &CoinDetail,
    aggregates: &Aggregates,
    wallets_by_chain: &BTreeMap<String, Vec<String>>,
    include_tickers: bool,
) -> EnrichedAsset {
    let summary = &candidate.summary;
    let node_id = candidate.node_id();

    let explorers = normalize_explorers(
        detail
            .links
            .blockchain_site
            .iter()
            .filter_map(|s| s.as_deref()),
    );
    let chain_platforms = platform_keys(&detail.platforms);
    let market_cap = summary.market_cap.unwrap_or(0.0);
    let volume_24h = summary.total_volume.unwrap_or(0.0);
    let weight = weight_score(market_cap, volume_24h, aggregates);

    let attributes = AssetAttributes {
        symbol: summary.symbol.clone().unwrap_or_default(),
        category: candidate.category.clone(),
        market_cap,
        volume_24h,
        rank: summary.market_cap_rank,
        is_multichain: chain_platforms.len() > 1,
        main_contract: main_contract(&detail.platforms),
        wallets_inferred: infer_wallets(&detail.platforms, wallets_by_chain),
        links_explorers: explorers.clone(),
        chain_platforms,
    };
    let name = summary.name.clone().unwrap_or_else(|| summary.id.clone());

    let mut linked = Vec::new();
    let mut edges = vec![Edge::new(
        &node_id,
        &category_node_id(&candidate.category),
        EdgeType::AssetCategory,
        weight,
    )];

    for host in &explorers {
        let node = Node::explorer(host);
        edges.push(Edge::new(&node_id, &node.node_id, EdgeType::AssetExplorer, weight));
        linked.push(node);
    }

    if include_tickers {
        let (nodes, exchange_edges) =
            exchange_links(&node_id, &exchange_listings(&detail.tickers), weight);
        linked.extend(nodes);
        edges.extend(exchange_edges);
    }

    EnrichedAsset {
        asset: Node::asset(node_id, name, attributes),
        linked,
        edges,
        weight,
    }
}

/// Fetches detail records and turns them into graph contributions.
pub struct DetailEnricher<'a> {
    client: &'a ApiClient,
    wallets_by_chain: &'a BTreeMap<String, Vec<String>>,
    include_tickers: bool,
}

impl<'a> DetailEnricher<'a> {
    pub fn new(
        client: &'a ApiClient,
        wallets_by_chain: &'a BTreeMap<String, Vec<String>>,
        include_tickers: bool,
    ) -> Self {
        Self {
            client,
            wallets_by_chain,
            include_tickers,
        }
    }

    pub async fn enrich(
        &self,
        candidate: &AssetCandidate,
        aggregates: &Aggregates,
    ) -> Result<EnrichedAsset, FetchError> {
        let detail =
            fetch_coin_detail(self.client, &candidate.summary.id, self.include_tickers, true).await?;

        let enriched = build_enriched_asset(
            candidate,
            &detail,
            aggregates,
            self.wallets_by_chain,
            self.include_tickers,
        );
        debug!(
            "Enriched {}: {} edges, weight {:.6}",
            candidate.summary.id,
            enriched.edges.len(),
            enriched.weight
        );
        Ok(enriched)
    }
}
