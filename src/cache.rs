//! Content-addressed cache of finalized pipeline outputs.
//!
//! The key is a stable digest of everything that determines the output: the
//! target model, the tokenizer version, the sorted fingerprints of the
//! canonicalized input blocks, and the output-affecting config options. Cache
//! errors are never fatal; the pipeline treats them as misses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;

use crate::config::OptimizeConfig;
use crate::pipeline::OptimizeOutcome;

/// Stable cache key with its component digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub model: String,
    pub tokenizer_version: String,
    pub input_digest: String,
    pub config_digest: String,
    pub key_hash: String,
}

impl CacheKey {
    pub fn new(
        model: &str,
        tokenizer_version: &str,
        input_fingerprints: &[String],
        config: &OptimizeConfig,
    ) -> Self {
        let mut fingerprints = input_fingerprints.to_vec();
        fingerprints.sort();
        let input_digest =
            hash_fields(&fingerprints.iter().map(String::as_str).collect::<Vec<_>>());
        let config_material = config.cache_key_material();
        let config_digest = hash_fields(&[&config_material]);
        let key_hash = hash_fields(&[model, tokenizer_version, &input_digest, &config_digest]);
        Self {
            model: model.to_string(),
            tokenizer_version: tokenizer_version.to_string(),
            input_digest,
            config_digest,
            key_hash,
        }
    }
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// Store for finalized outcomes. Implementations may be in-process or remote;
/// either way the pipeline survives their failure.
#[async_trait]
pub trait PromptCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<OptimizeOutcome>, CacheError>;
    async fn put(
        &self,
        key: &CacheKey,
        value: &OptimizeOutcome,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}

/// In-process cache with per-entry TTL.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (OptimizeOutcome, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }
}

#[async_trait]
impl PromptCache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<OptimizeOutcome>, CacheError> {
        let entries = self.entries.read().await;
        match entries.get(&key.key_hash) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            _ => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &CacheKey,
        value: &OptimizeOutcome,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.key_hash.clone(), (value.clone(), Instant::now() + ttl));
        Ok(())
    }
}

/// Per-key lock registry collapsing concurrent identical runs: the first
/// caller computes, later callers wait on the key lock and then observe the
/// cached value.
#[derive(Default)]
pub struct SingleFlight {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting behind any in-flight holder.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > 1024 {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
