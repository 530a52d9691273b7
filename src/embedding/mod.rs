//! Retrieval backends for the three search methods
//!
//! - EmbeddingProvider trait with a local FastEmbed implementation
//! - VectorIndex for exact cosine search over dense embeddings
//! - SparseIndex and LexicalEncoder for lexical-weight search
//! - KeywordIndex (Tantivy) for BM25 full-text search
//! - BatchProcessor to load a corpus into all of the above

mod batch;
mod keyword_index;
mod provider;
mod sparse;
mod vector_index;

pub use batch::{BatchProcessor, BatchResult};
pub use keyword_index::{KeywordIndex, KeywordIndexError, KeywordSearchResult};
pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider};
pub use sparse::{
    LexicalEncoder, SparseIndex, SparseIndexError, SparseSearchResult, SparseVector,
    TermWeightEncoder,
};
pub use vector_index::{cosine_similarity, SearchResult, VectorIndex, VectorIndexError};

use serde::{Deserialize, Serialize};

/// Configuration for embedding generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model name (e.g., "all-MiniLM-L6-v2")
    pub model: String,
    /// Number of documents embedded per model call while indexing
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "all-MiniLM-L6-v2".to_string(),
            batch_size: 32,
        }
    }
}
