//! On-disk response cache for successful API reads.
//!
//! Each entry is one JSON file named by the SHA-256 of the request URL and its
//! query pairs. Entries younger than the TTL are served instead of a live
//! request; older entries are kept so the client can fall back to them when the
//! API is unavailable (stale-if-error).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    url: String,
    fetched_at: DateTime<Utc>,
    body: serde_json::Value,
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Within TTL, serve directly
    Fresh(serde_json::Value),
    /// Expired, only usable when the live request fails
    Stale(serde_json::Value),
    Miss,
}

pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    pub fn open(dir: &Path, ttl: Duration) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            ttl,
        })
    }

    /// Cache key for a GET request. Query order is significant, matching how
    /// the request is sent.
    pub fn key(url: &str, query: &[(&str, String)]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        for (name, value) in query {
            hasher.update(b"\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn lookup(&self, key: &str) -> CacheLookup {
        let path = self.entry_path(key);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return CacheLookup::Miss,
        };

        let entry: CacheEntry = match serde_json::from_str(&contents) {
            Ok(e) => e,
            Err(e) => {
                warn!("Ignoring corrupt cache entry {:?}: {}", path, e);
                return CacheLookup::Miss;
            }
        };

        let age = Utc::now()
            .signed_duration_since(entry.fetched_at)
            .to_std()
            .unwrap_or_default();

        if age < self.ttl {
            debug!("Cache hit for {} (age {:?})", entry.url, age);
            CacheLookup::Fresh(entry.body)
        } else {
            CacheLookup::Stale(entry.body)
        }
    }

    /// Store a successful body. Written to a temporary file and renamed so a
    /// reader never sees a partial entry.
    pub fn store(&self, key: &str, url: &str, body: &serde_json::Value) -> Result<(), CacheError> {
        self.store_at(key, url, body, Utc::now())
    }

    fn store_at(
        &self,
        key: &str,
        url: &str,
        body: &serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry {
            url: url.to_string(),
            fetched_at,
            body: body.clone(),
        };
        let path = self.entry_path(key);
        let tmp = path.with_extension("json.part");
        std::fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
