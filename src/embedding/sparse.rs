//! Sparse lexical-weight vectors and an exact index over them
use ahash::AHashMap;
use regex::Regex;
use std::sync::RwLock;
use thiserror::Error;

use super::EmbeddingError;

#[derive(Error, Debug)]
pub enum SparseIndexError {
    #[error("Index lock poisoned")]
    LockPoisoned,
}

/// Token → weight map produced by a lexical encoder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    weights: AHashMap<String, f32>,
}

impl SparseVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the weight of `token`, replacing any previous weight
    pub fn insert(&mut self, token: impl Into<String>, weight: f32) {
        self.weights.insert(token.into(), weight);
    }

    pub fn get(&self, token: &str) -> Option<f32> {
        self.weights.get(token).copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Weighted dot product over the tokens both vectors share.
    ///
    /// Returns 0.0 when either side is empty or the product is not finite.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };

        let score: f32 = small
            .weights
            .iter()
            .filter_map(|(token, w)| large.weights.get(token).map(|o| w * o))
            .sum();

        if score.is_finite() {
            score
        } else {
            0.0
        }
    }
}

impl<S: Into<String>> FromIterator<(S, f32)> for SparseVector {
    fn from_iter<I: IntoIterator<Item = (S, f32)>>(iter: I) -> Self {
        Self {
            weights: iter.into_iter().map(|(t, w)| (t.into(), w)).collect(),
        }
    }
}

/// Produces lexical-weight vectors for queries and documents
///
/// Allows abstraction over learned sparse encoders and plain term weighting.
pub trait LexicalEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<SparseVector, EmbeddingError>;
}

/// Sublinear term-frequency weighting: `1 + ln(tf)` per lowercase word token
#[derive(Debug, Clone)]
pub struct TermWeightEncoder {
    token_pattern: Regex,
}

impl TermWeightEncoder {
    pub fn new() -> Result<Self, EmbeddingError> {
        let token_pattern = Regex::new(r"[\p{L}\p{N}]+")
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;
        Ok(Self { token_pattern })
    }
}

impl LexicalEncoder for TermWeightEncoder {
    fn encode(&self, text: &str) -> Result<SparseVector, EmbeddingError> {
        let mut counts: AHashMap<String, u32> = AHashMap::new();
        for token in self.token_pattern.find_iter(text) {
            *counts.entry(token.as_str().to_lowercase()).or_insert(0) += 1;
        }

        Ok(counts
            .into_iter()
            .map(|(token, tf)| (token, 1.0 + (tf as f32).ln()))
            .collect())
    }
}

/// Search result with ID and sparse similarity score
#[derive(Debug, Clone)]
pub struct SparseSearchResult {
    pub id: String,
    pub score: f32,
}

/// In-memory index of document lexical-weight vectors
#[derive(Default)]
pub struct SparseIndex {
    vectors: RwLock<AHashMap<String, SparseVector>>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the vector for `id`
    pub fn insert(&self, id: impl Into<String>, vector: SparseVector) -> Result<(), SparseIndexError> {
        let mut vectors = self
            .vectors
            .write()
            .map_err(|_| SparseIndexError::LockPoisoned)?;
        vectors.insert(id.into(), vector);
        Ok(())
    }

    /// Return up to `limit` documents sharing at least one token with
    /// `query`, by dot product descending then id ascending.
    pub fn search(
        &self,
        query: &SparseVector,
        limit: usize,
    ) -> Result<Vec<SparseSearchResult>, SparseIndexError> {
        if limit == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self
            .vectors
            .read()
            .map_err(|_| SparseIndexError::LockPoisoned)?;

        let mut results: Vec<SparseSearchResult> = vectors
            .iter()
            .filter_map(|(id, vector)| {
                let score = query.dot(vector);
                (score > 0.0).then(|| SparseSearchResult {
                    id: id.clone(),
                    score,
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        results.truncate(limit);

        Ok(results)
    }

    pub fn len(&self) -> usize {
        self.vectors.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
