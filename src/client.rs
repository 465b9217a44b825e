//! CoinGecko HTTP client with pacing, retry/backoff and response caching.
//!
//! Provides a wrapper around the public REST API with:
//! - Client-side pacing of live requests (requests per minute)
//! - Bounded retries on 429/502/503/504, honoring `Retry-After`
//! - Exponential backoff with jitter when no advisory wait is given
//! - A 24h on-disk response cache with stale-if-error fallback
//!
//! One `ApiClient` is built per run and shared by reference between the
//! category resolver and the detail enricher.

use crate::cache::{CacheLookup, ResponseCache};
use crate::config::{PipelineConfig, RateLimitConfig};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// User-Agent string for API requests.
const USER_AGENT: &str = concat!("crypto-graph-pipeline/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Rate limited (HTTP 429) on {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: u32 },

    #[error("Server unavailable (HTTP {status}) on {url} after {attempts} attempts")]
    ServerUnavailable {
        url: String,
        status: u16,
        attempts: u32,
    },

    #[error("Not found (HTTP 404): {url}")]
    NotFound { url: String },

    #[error("HTTP {status} on {url}")]
    ClientError { url: String, status: u16 },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response body: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl FetchError {
    fn from_status(status: u16, url: &str, attempts: u32) -> Self {
        let url = url.to_string();
        match status {
            429 => FetchError::RateLimited { url, attempts },
            502..=504 => FetchError::ServerUnavailable {
                url,
                status,
                attempts,
            },
            404 => FetchError::NotFound { url },
            _ => FetchError::ClientError { url, status },
        }
    }

    /// Failures for which an expired cache entry is an acceptable answer.
    /// A 404 or other client error is authoritative and never masked.
    fn allows_stale(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. }
                | FetchError::ServerUnavailable { .. }
                | FetchError::Network(_)
        )
    }
}

/// Retry/backoff policy for retryable HTTP statuses
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_cap_secs: f64,
    pub retry_after_floor_secs: f64,
    pub retry_after_fallback_secs: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_cap_secs: config.backoff_cap_secs,
            retry_after_floor_secs: config.retry_after_floor_secs,
            retry_after_fallback_secs: config.retry_after_fallback_secs,
        }
    }

    pub fn is_retryable(status: u16) -> bool {
        matches!(status, 429 | 502 | 503 | 504)
    }

    /// Wait before retry number `attempt` (1-based). `jitter` is in [0, 1).
    pub fn wait_for(&self, attempt: u32, retry_after: Option<&str>, jitter: f64) -> Duration {
        let secs = match retry_after {
            Some(value) => match value.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => v.max(self.retry_after_floor_secs),
                _ => self.retry_after_fallback_secs,
            },
            None => {
                let exp = 2f64.powi(attempt.min(62) as i32);
                (exp + jitter).min(self.backoff_cap_secs)
            }
        };
        Duration::try_from_secs_f64(secs.max(0.0))
            .unwrap_or_else(|_| Duration::from_secs_f64(self.retry_after_fallback_secs.max(0.0)))
    }
}

/// Rate-limited, caching CoinGecko client.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
    rate_limiter: DefaultDirectRateLimiter,
    cache: Option<ResponseCache>,
    live_requests: AtomicU64,
}

impl ApiClient {
    pub fn new(config: &PipelineConfig) -> Result<Self, FetchError> {
        let limits = &config.rate_limits;
        let quota = Quota::per_minute(
            NonZeroU32::new(limits.requests_per_minute).unwrap_or(NonZeroU32::MIN),
        );

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| FetchError::InvalidConfig(format!("API key header: {e}")))?;
            headers.insert("x-cg-demo-api-key", value);
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(limits.request_timeout_secs))
            .build()?;

        let cache = if config.cache.enabled {
            let ttl = Duration::from_secs(config.cache.ttl_secs);
            Some(
                ResponseCache::open(&config.cache.dir, ttl)
                    .map_err(|e| FetchError::InvalidConfig(format!("response cache: {e}")))?,
            )
        } else {
            None
        };

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            policy: RetryPolicy::from_config(limits),
            rate_limiter: RateLimiter::direct(quota),
            cache,
            live_requests: AtomicU64::new(0),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Number of HTTP requests actually sent (cache hits excluded).
    pub fn live_requests(&self) -> u64 {
        self.live_requests.load(Ordering::SeqCst)
    }

    /// GET `path` with `query` and return the JSON body.
    ///
    /// Fresh cache entries short-circuit the network entirely, so a cached
    /// request never waits on the pacer or a backoff.
    pub async fn fetch(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let url = self.endpoint(path);
        let key = ResponseCache::key(&url, query);

        let mut stale = None;
        if let Some(cache) = &self.cache {
            match cache.lookup(&key) {
                CacheLookup::Fresh(body) => return Ok(body),
                CacheLookup::Stale(body) => stale = Some(body),
                CacheLookup::Miss => {}
            }
        }

        match self.fetch_live(&url, query).await {
            Ok(body) => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.store(&key, &url, &body) {
                        warn!("Failed to cache response for {}: {}", url, e);
                    }
                }
                Ok(body)
            }
            Err(e) if e.allows_stale() => match stale {
                Some(body) => {
                    warn!("{}, serving stale cached response", e);
                    Ok(body)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Typed variant of [`ApiClient::fetch`].
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let body = self.fetch(path, query).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Live request with bounded retries. At most `max_retries + 1` requests.
    async fn fetch_live(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let mut attempt: u32 = 0;

        loop {
            self.rate_limiter.until_ready().await;
            self.live_requests.fetch_add(1, Ordering::SeqCst);

            let response = self.client.get(url).query(query).send().await?;
            let status = response.status().as_u16();

            if status == 200 {
                let bytes = response.bytes().await?;
                return Ok(serde_json::from_slice(&bytes)?);
            }

            if RetryPolicy::is_retryable(status) && attempt < self.policy.max_retries {
                attempt += 1;
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let jitter: f64 = rand::thread_rng().gen();
                let wait = self.policy.wait_for(attempt, retry_after.as_deref(), jitter);

                warn!(
                    "[attempt {}/{}] HTTP {} on {}, retrying in {:?}",
                    attempt, self.policy.max_retries, status, url, wait
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            debug!("HTTP {} on {} (attempt {})", status, url, attempt + 1);
            return Err(FetchError::from_status(status, url, attempt + 1));
        }
    }
}
