//! Exact dense vector index for cosine similarity search
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("Index lock poisoned")]
    LockPoisoned,

    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },
}

/// Search result with ID and similarity score
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Document or chunk identifier
    pub id: String,
    /// Cosine similarity in [-1.0, 1.0], 0.0 when either vector is all zeros
    pub score: f32,
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 (never NaN) when either vector has zero magnitude or the
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (mag_a * mag_b);
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

/// In-memory dense vector index
///
/// Scores every stored vector against the query (exact search). Corpora
/// handed to the retrieval core are small enough that an approximate index
/// is not worth its recall loss.
pub struct VectorIndex {
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    dimension: usize,
}

impl VectorIndex {
    /// Create an empty index for vectors of `dimension` components
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: RwLock::new(HashMap::new()),
            dimension,
        }
    }

    /// Insert or replace the vector for `id`
    pub fn insert(&self, id: impl Into<String>, vector: &[f32]) -> Result<(), VectorIndexError> {
        if vector.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let mut vectors = self
            .vectors
            .write()
            .map_err(|_| VectorIndexError::LockPoisoned)?;
        vectors.insert(id.into(), vector.to_vec());

        Ok(())
    }

    /// Insert a batch of vectors under one write lock.
    ///
    /// Every dimension is checked first, so a bad vector leaves the index
    /// unchanged.
    pub fn insert_batch(&self, items: &[(String, Vec<f32>)]) -> Result<(), VectorIndexError> {
        if let Some((_, vector)) = items.iter().find(|(_, v)| v.len() != self.dimension) {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let mut vectors = self
            .vectors
            .write()
            .map_err(|_| VectorIndexError::LockPoisoned)?;
        for (id, vector) in items {
            vectors.insert(id.clone(), vector.clone());
        }

        Ok(())
    }

    /// Return the `k` most similar vectors, sorted by score descending.
    ///
    /// Ties are ordered by id so repeated searches are reproducible.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, VectorIndexError> {
        if query.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        if k == 0 {
            return Ok(Vec::new());
        }

        let vectors = self
            .vectors
            .read()
            .map_err(|_| VectorIndexError::LockPoisoned)?;

        let mut results: Vec<SearchResult> = vectors
            .iter()
            .map(|(id, vector)| SearchResult {
                id: id.clone(),
                score: cosine_similarity(query, vector),
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        results.truncate(k);

        Ok(results)
    }

    /// Get the number of vectors in the index
    pub fn len(&self) -> usize {
        self.vectors.read().map(|v| v.len()).unwrap_or(0)
    }

    /// Check if index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}
