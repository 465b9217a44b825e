//! Configuration management for the collection pipeline.
//!
//! Supports loading from environment variables, config files, and CLI arguments.
//! Every value has a default matching the collector's tuned settings, so a bare
//! `PipelineConfig::load()` is enough to run against the public API.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Base URL of the CoinGecko v3 API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Optional demo API key, sent as `x-cg-demo-api-key`
    #[serde(default)]
    pub api_key: Option<String>,

    /// Configured categories, in processing order
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryConfig>,

    /// Maximum number of assets kept per category
    #[serde(default = "default_per_category_limit")]
    pub per_category_limit: usize,

    /// Chain platform id -> wallet names supporting it
    #[serde(default = "default_wallets_by_chain")]
    pub wallets_by_chain: BTreeMap<String, Vec<String>>,

    /// Retry and pacing configuration
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Collection loop settings
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Response cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Output directory paths
    #[serde(default)]
    pub paths: PathConfig,
}

/// A thematic category and the API slugs that may name it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryConfig {
    /// Human label, used for the `class:<label>` node
    pub label: String,

    /// Candidate slugs, tried in order
    pub aliases: Vec<String>,
}

impl CategoryConfig {
    pub fn new(label: &str, aliases: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum retry attempts for 429/502/503/504
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Client-side pacing of live requests
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,

    /// Upper bound of the exponential backoff (seconds)
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: f64,

    /// Lower bound applied to an advisory `Retry-After` (seconds)
    #[serde(default = "default_retry_after_floor_secs")]
    pub retry_after_floor_secs: f64,

    /// Wait used when `Retry-After` cannot be parsed (seconds)
    #[serde(default = "default_retry_after_fallback_secs")]
    pub retry_after_fallback_secs: f64,

    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            requests_per_minute: default_rpm(),
            backoff_cap_secs: default_backoff_cap_secs(),
            retry_after_floor_secs: default_retry_after_floor_secs(),
            retry_after_fallback_secs: default_retry_after_fallback_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Randomized pause between asset detail requests, `(low, high)` seconds
    #[serde(default = "default_detail_sleep_secs")]
    pub detail_sleep_secs: (f64, f64),

    /// Fixed pause between market pages (ms)
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    /// Fetch exchange tickers with each asset detail
    #[serde(default)]
    pub include_tickers: bool,

    /// Log a progress line every N processed assets
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            detail_sleep_secs: default_detail_sleep_secs(),
            page_delay_ms: default_page_delay_ms(),
            include_tickers: false,
            progress_every: default_progress_every(),
        }
    }
}

impl CollectionConfig {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    /// Random pause drawn from `detail_sleep_secs`
    pub fn detail_pause(&self) -> Duration {
        let (low, high) = self.detail_sleep_secs;
        if high <= low {
            return Duration::from_secs_f64(low.max(0.0));
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(low..high))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Entries younger than this are served without a network request
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Checkpoint and final tables live here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            metadata_dir: default_metadata_dir(),
        }
    }
}

// Default value functions
fn default_api_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_categories() -> Vec<CategoryConfig> {
    vec![
        CategoryConfig::new(
            "Artificial Intelligence",
            &["artificial intelligence", "ai", "ai & big data", "ai-big-data"],
        ),
        CategoryConfig::new("Gaming", &["gaming", "gamefi", "play-to-earn"]),
        CategoryConfig::new(
            "Real World Assets",
            &["real-world-assets-rwa", "real world assets", "rwa", "real-world-assets"],
        ),
        CategoryConfig::new("Memes", &["meme", "memecoin", "meme token", "memes"]),
    ]
}

fn default_per_category_limit() -> usize {
    250
}

fn default_wallets_by_chain() -> BTreeMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 7] = [
        ("ethereum", &["MetaMask", "Trust Wallet"]),
        ("binance-smart-chain", &["Trust Wallet"]),
        ("polygon-pos", &["MetaMask", "Trust Wallet"]),
        ("solana", &["Phantom", "Solflare"]),
        ("avalanche", &["Core", "MetaMask"]),
        ("arbitrum-one", &["MetaMask"]),
        ("optimistic-ethereum", &["MetaMask"]),
    ];
    table
        .iter()
        .map(|(chain, wallets)| {
            (
                chain.to_string(),
                wallets.iter().map(|w| w.to_string()).collect(),
            )
        })
        .collect()
}

fn default_max_retries() -> u32 {
    6
}

fn default_rpm() -> u32 {
    30 // Public tier allowance
}

fn default_backoff_cap_secs() -> f64 {
    60.0
}

fn default_retry_after_floor_secs() -> f64 {
    1.0
}

fn default_retry_after_fallback_secs() -> f64 {
    5.0
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_detail_sleep_secs() -> (f64, f64) {
    (0.6, 1.0)
}

fn default_page_delay_ms() -> u64 {
    800
}

fn default_progress_every() -> usize {
    25
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/cache")
}

fn default_cache_ttl_secs() -> u64 {
    24 * 3600
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("data/metadata")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_key: None,
            categories: default_categories(),
            per_category_limit: default_per_category_limit(),
            wallets_by_chain: default_wallets_by_chain(),
            rate_limits: RateLimitConfig::default(),
            collection: CollectionConfig::default(),
            cache: CacheConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment (defaults for everything else)
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML config file with environment overrides
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = ::toml::from_str(&contents)?;

        // Environment variables override file settings
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("COINGECKO_BASE_URL") {
            self.api_base_url = url;
        }
        if let Ok(key) = std::env::var("COINGECKO_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = Some(key);
            }
        }
    }

    /// Reject configurations the collector cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.categories.is_empty() {
            anyhow::bail!("at least one category must be configured");
        }
        if let Some(empty) = self.categories.iter().find(|c| c.aliases.is_empty()) {
            anyhow::bail!("category '{}' has no aliases", empty.label);
        }
        if self.per_category_limit == 0 {
            anyhow::bail!("per_category_limit must be > 0");
        }
        let (lo, hi) = self.collection.detail_sleep_secs;
        if lo < 0.0 || hi < lo {
            anyhow::bail!("detail_sleep_secs must satisfy 0 <= low <= high (got {lo}, {hi})");
        }
        if self.rate_limits.requests_per_minute == 0 {
            anyhow::bail!("requests_per_minute must be > 0");
        }
        Ok(())
    }

    /// Point all output paths below `dir`
    pub fn set_output_dir(&mut self, dir: &std::path::Path) {
        self.paths.data_dir = dir.to_path_buf();
        self.paths.metadata_dir = dir.join("metadata");
        self.cache.dir = dir.join("cache");
    }

    /// Ensure all output directories exist
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.paths.data_dir)?;
        std::fs::create_dir_all(&self.paths.metadata_dir)?;
        if self.cache.enabled {
            std::fs::create_dir_all(&self.cache.dir)?;
        }
        Ok(())
    }
}
