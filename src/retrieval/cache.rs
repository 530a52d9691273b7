//! Memoization of cross-encoder output

use crate::retrieval::RerankedResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// A memoized rerank for one (query, candidate set) pair
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    /// Full shortlist in reranked order
    pub value: Vec<RerankedResult>,
    pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Vec<RerankedResult>) -> Self {
        Self {
            key: key.into(),
            value,
            inserted_at: Utc::now(),
        }
    }
}

/// Storage for rerank results shared across concurrent searches
///
/// Implementations must be safe for concurrent use and own their eviction
/// policy; the rerank engine only reads and writes through this trait.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;
    fn set(&self, key: &str, entry: CacheEntry);
}

/// Stable cache key over the query text and the sorted candidate ids
pub fn rerank_cache_key<'a, I>(query: &str, candidate_ids: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut ids: Vec<&str> = candidate_ids.into_iter().collect();
    ids.sort_unstable();

    // Length prefixes keep ("ab", "c") distinct from ("a", "bc")
    let mut hasher = blake3::Hasher::new();
    for part in std::iter::once(query).chain(ids) {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Unbounded in-memory cache; entries are never overwritten once written
#[derive(Default)]
pub struct MemoryRerankCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryRerankCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryRerankCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, entry: CacheEntry) {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.entry(key.to_string()).or_insert(entry);
            }
            Err(_) => tracing::warn!("Rerank cache lock poisoned, dropping entry"),
        }
    }
}
