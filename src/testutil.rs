//! Shared fixtures for unit tests.

use crate::config::PipelineConfig;
use serde_json::{json, Value};
use std::path::Path;

/// Config pointed at a mock server: no sleeps, no cache, instant retries.
pub fn test_config(base_url: &str, data_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.api_base_url = base_url.to_string();
    config.set_output_dir(data_dir);
    config.cache.enabled = false;
    config.rate_limits.requests_per_minute = 60_000;
    config.rate_limits.retry_after_floor_secs = 0.0;
    config.rate_limits.request_timeout_secs = 10;
    config.collection.detail_sleep_secs = (0.0, 0.0);
    config.collection.page_delay_ms = 0;
    config
}

/// One `/coins/markets` row
pub fn market_row(id: &str, market_cap: f64, volume: f64, rank: u32) -> Value {
    json!({
        "id": id,
        "symbol": id.chars().take(4).collect::<String>(),
        "name": id.to_uppercase(),
        "market_cap": market_cap,
        "total_volume": volume,
        "market_cap_rank": rank,
        "current_price": 1.0,
    })
}

/// A `/coins/{id}` body with one Ethereum platform and one explorer
pub fn detail_body(id: &str) -> Value {
    json!({
        "id": id,
        "platforms": { "ethereum": format!("0x{id}") },
        "links": { "blockchain_site": [format!("https://etherscan.io/token/0x{id}"), ""] },
    })
}
