//! Category alias resolution.
//!
//! CoinGecko category slugs drift over time ("meme" vs "meme-token"), so each
//! configured category carries several aliases. They are normalized, extended
//! with known extra spellings and tried in order; the first alias that yields
//! any assets wins and is used exclusively.

use crate::client::{ApiClient, FetchError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hard page-size limit of `/coins/markets`
pub const MAX_PAGE_SIZE: usize = 250;

/// One row of `/coins/markets`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub id: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub total_volume: Option<f64>,
    #[serde(default)]
    pub market_cap_rank: Option<u32>,
    #[serde(default)]
    pub current_price: Option<f64>,
}

/// Outcome of resolving one category
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// `slug` produced a non-empty asset list
    Found {
        slug: String,
        assets: Vec<MarketSummary>,
    },
    /// Every candidate was missing or empty
    Exhausted,
}

impl Resolution {
    pub fn into_assets(self) -> Vec<MarketSummary> {
        match self {
            Resolution::Found { assets, .. } => assets,
            Resolution::Exhausted => Vec::new(),
        }
    }
}

/// Normalize a human label or alias into an API slug.
pub fn normalize_slug(raw: &str) -> String {
    raw.trim().to_lowercase().replace('&', "and").replace(' ', "-")
}

/// Ordered, deduplicated slug candidates for a set of aliases.
pub fn candidate_slugs<S: AsRef<str>>(aliases: &[S]) -> Vec<String> {
    let mut candidates: Vec<String> = aliases
        .iter()
        .map(|a| normalize_slug(a.as_ref()))
        .filter(|c| !c.is_empty())
        .collect();

    let has_any = |set: &[&str]| candidates.iter().any(|c| set.contains(&c.as_str()));
    let mut extra = Vec::new();
    if has_any(&["real-world-assets", "rwa"]) {
        extra.push("real-world-assets-rwa".to_string());
    }
    if has_any(&["memes", "memecoin", "meme-token"]) {
        extra.push("meme".to_string());
    }
    candidates.extend(extra);

    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.clone()));
    candidates
}

/// Resolves configured categories into asset lists.
pub struct CategoryResolver<'a> {
    client: &'a ApiClient,
    page_delay: Duration,
}

impl<'a> CategoryResolver<'a> {
    pub fn new(client: &'a ApiClient, page_delay: Duration) -> Self {
        Self { client, page_delay }
    }

    /// Try each candidate slug in order and return the first non-empty result,
    /// truncated to `limit`. A 404 moves on to the next candidate; any other
    /// error is returned.
    pub async fn resolve<S: AsRef<str>>(
        &self,
        label: &str,
        aliases: &[S],
        limit: usize,
    ) -> Result<Resolution, FetchError> {
        let candidates = candidate_slugs(aliases);
        debug!("Category '{}' candidates: {:?}", label, candidates);

        for slug in candidates {
            match self.fetch_markets(&slug, limit).await {
                Ok(mut assets) if !assets.is_empty() => {
                    assets.truncate(limit);
                    info!(
                        "Category '{}' resolved via '{}' ({} assets)",
                        label,
                        slug,
                        assets.len()
                    );
                    return Ok(Resolution::Found { slug, assets });
                }
                Ok(_) => {
                    debug!("Category '{}': slug '{}' returned no assets", label, slug);
                }
                Err(FetchError::NotFound { .. }) => {
                    warn!("Category '{}': slug '{}' not found, trying next", label, slug);
                }
                Err(e) => return Err(e),
            }
        }

        warn!("Category '{}': no alias returned any assets", label);
        Ok(Resolution::Exhausted)
    }

    /// Page through `/coins/markets` for one slug, ordered by market cap.
    async fn fetch_markets(&self, slug: &str, limit: usize) -> Result<Vec<MarketSummary>, FetchError> {
        let per_page = limit.clamp(1, MAX_PAGE_SIZE);
        let mut assets: Vec<MarketSummary> = Vec::new();
        let mut page: u32 = 1;

        loop {
            let query = [
                ("vs_currency", "usd".to_string()),
                ("category", slug.to_string()),
                ("order", "market_cap_desc".to_string()),
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
                ("price_change_percentage", "24h".to_string()),
                ("locale", "en".to_string()),
            ];
            let rows: Vec<MarketSummary> = self.client.fetch_json("coins/markets", &query).await?;

            let page_len = rows.len();
            assets.extend(rows);
            debug!(
                "Slug '{}' page {}: {} rows ({} total)",
                slug,
                page,
                page_len,
                assets.len()
            );

            if page_len < per_page || assets.len() >= limit {
                break;
            }
            page += 1;
            tokio::time::sleep(self.page_delay).await;
        }

        Ok(assets)
    }
}
