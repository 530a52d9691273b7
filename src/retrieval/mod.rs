//! Hybrid retrieval and reranking
//!
//! Full-text, dense-vector and sparse-vector search run concurrently, their
//! ranked lists are combined with weighted Reciprocal Rank Fusion, and the
//! head of the fused list can be re-scored by a cross-encoder.

mod adapters;
mod cache;
mod cross_encoder;
mod document;
mod fusion;
mod orchestrator;
mod reranker;

pub use adapters::{DenseAdapter, FtsAdapter, RetrievalAdapter, RetrievalError, SparseAdapter};
pub use cache::{rerank_cache_key, CacheEntry, CacheStore, MemoryRerankCache};
pub use cross_encoder::{CrossEncoder, CrossEncoderError, Device, FastEmbedCrossEncoder};
pub use document::{Document, DocumentStore, DocumentStoreError, MemoryDocumentStore};
pub use fusion::{reciprocal_rank_fusion, FusionEngine, RankedList, DEFAULT_RRF_K};
pub use orchestrator::{SearchError, SearchOrchestrator};
pub use reranker::{
    CandidateWithText, RerankEngine, RerankError, RerankOptions, RerankOutcome,
};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The three independent retrieval signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    /// Keyword search over title/body
    Fts,
    /// Cosine similarity between dense embeddings
    Dense,
    /// Dot product between lexical-weight vectors
    Sparse,
}

impl RetrievalMethod {
    pub const ALL: [RetrievalMethod; 3] = [Self::Fts, Self::Dense, Self::Sparse];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fts => "fts",
            Self::Dense => "dense",
            Self::Sparse => "sparse",
        }
    }
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fts" | "keyword" => Ok(Self::Fts),
            "dense" | "semantic" => Ok(Self::Dense),
            "sparse" | "lexical" => Ok(Self::Sparse),
            other => Err(format!(
                "Unknown retrieval method '{}', expected one of fts, dense, sparse",
                other
            )),
        }
    }
}

/// Search query with optional filters and per-method weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Query text
    pub text: String,

    /// Metadata constraints; every pair must match for a document to be kept
    #[serde(default)]
    pub filters: BTreeMap<String, String>,

    /// Maximum number of results
    pub limit: usize,

    /// Weight overrides, taking precedence over `SearchConfig::method_weights`
    #[serde(default)]
    pub weights: HashMap<RetrievalMethod, f32>,
}

impl Query {
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            filters: BTreeMap::new(),
            limit,
            weights: HashMap::new(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn with_weight(mut self, method: RetrievalMethod, weight: f32) -> Self {
        self.weights.insert(method, weight);
        self
    }

    /// Check the invariants every query must satisfy before retrieval
    pub fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("Query text cannot be empty".to_string());
        }
        if self.limit == 0 {
            return Err("Query limit must be greater than 0".to_string());
        }
        if let Some((method, weight)) = self
            .weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(format!(
                "Weight for {} must be a non-negative number, got {}",
                method, weight
            ));
        }
        Ok(())
    }
}

/// A candidate surfaced by one adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Document or chunk identifier
    pub id: String,
    /// 1-based position in the adapter's list
    pub rank: usize,
    /// Adapter-native score; not comparable across adapters
    pub raw_score: f32,
}

impl Candidate {
    pub fn new(id: impl Into<String>, rank: usize, raw_score: f32) -> Self {
        Self {
            id: id.into(),
            rank,
            raw_score,
        }
    }

    /// Assign 1-based ranks to `(id, score)` pairs that are already in
    /// relevance order
    pub fn ranked<I, S>(hits: I) -> Vec<Candidate>
    where
        I: IntoIterator<Item = (S, f32)>,
        S: Into<String>,
    {
        hits.into_iter()
            .enumerate()
            .map(|(i, (id, score))| Candidate::new(id, i + 1, score))
            .collect()
    }
}

/// Output of fusion for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub id: String,
    pub fused_score: f64,
    /// Methods with non-zero weight whose list contained this candidate
    pub contributing_methods: BTreeSet<RetrievalMethod>,
}

/// Output of cross-encoder reranking for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankedResult {
    pub id: String,
    /// Raw cross-encoder score
    pub rerank_score: f64,
    /// 1-based position before reranking
    pub original_rank: usize,
    /// 1-based position after reranking
    pub new_rank: usize,
}

/// One entry of the final response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub id: String,
    /// Score that determined this position: the rerank score when reranked,
    /// the fused score otherwise
    pub score: f64,
    pub fused_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
    pub contributing_methods: Vec<RetrievalMethod>,
}

impl ScoredCandidate {
    fn from_fused(fused: &FusedResult) -> Self {
        Self {
            id: fused.id.clone(),
            score: fused.fused_score,
            fused_score: fused.fused_score,
            rerank_score: None,
            contributing_methods: fused.contributing_methods.iter().copied().collect(),
        }
    }
}

/// Per-call search settings
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Adapters to run; adapters for other methods are ignored
    pub enabled_methods: BTreeSet<RetrievalMethod>,
    /// Fusion weight per method; methods without an entry get 1.0
    pub method_weights: HashMap<RetrievalMethod, f32>,
    /// Budget for each adapter call
    pub per_method_timeout: Duration,
    /// Whether to run the cross-encoder over the fused shortlist
    pub rerank: bool,
    /// Shortlist size handed to the cross-encoder
    pub rerank_top_n: usize,
    /// Each adapter is asked for `limit * search_multiplier` candidates
    pub search_multiplier: usize,
}

impl SearchConfig {
    /// Weight for `method`, with the query's override taking precedence
    pub fn weight_for(&self, query: &Query, method: RetrievalMethod) -> f32 {
        query
            .weights
            .get(&method)
            .or_else(|| self.method_weights.get(&method))
            .copied()
            .unwrap_or(1.0)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled_methods: RetrievalMethod::ALL.into_iter().collect(),
            method_weights: RetrievalMethod::ALL.into_iter().map(|m| (m, 1.0)).collect(),
            per_method_timeout: Duration::from_secs(2),
            rerank: false,
            rerank_top_n: 20,
            search_multiplier: 2,
        }
    }
}

/// Result of one orchestrated search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredCandidate>,
    /// True when at least one enabled method failed or timed out
    pub degraded: bool,
    /// Names of the methods that failed, sorted
    pub failed_methods: Vec<String>,
    /// True only when the cross-encoder order was applied
    pub reranked: bool,
    /// Stage durations in milliseconds, keyed by method name or stage
    pub timing_ms: BTreeMap<String, u64>,
}
