//! Retrieval adapters: one uniform contract over the three search backends

use crate::embedding::{EmbeddingProvider, KeywordIndex, LexicalEncoder, SparseIndex, VectorIndex};
use crate::retrieval::{Candidate, Query, RetrievalMethod};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("{method} retrieval timed out after {timeout_ms}ms")]
    Timeout {
        method: RetrievalMethod,
        timeout_ms: u64,
    },

    #[error("{method} retrieval unavailable: {reason}")]
    Unavailable {
        method: RetrievalMethod,
        reason: String,
    },
}

impl RetrievalError {
    pub fn unavailable(method: RetrievalMethod, reason: impl ToString) -> Self {
        Self::Unavailable {
            method,
            reason: reason.to_string(),
        }
    }

    pub fn method(&self) -> RetrievalMethod {
        match self {
            Self::Timeout { method, .. } | Self::Unavailable { method, .. } => *method,
        }
    }
}

/// A source of ranked candidates for a query
///
/// Implementations are pure request/response: they read their backend and
/// never mutate shared state. Returned candidates carry 1-based ranks in
/// relevance order.
#[async_trait]
pub trait RetrievalAdapter: Send + Sync {
    fn method(&self) -> RetrievalMethod;

    async fn retrieve(&self, query: &Query, limit: usize)
        -> Result<Vec<Candidate>, RetrievalError>;

    /// `retrieve` bounded by `timeout`; the in-flight call is dropped when
    /// the budget runs out.
    async fn retrieve_with_timeout(
        &self,
        query: &Query,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        match tokio::time::timeout(timeout, self.retrieve(query, limit)).await {
            Ok(result) => result,
            Err(_) => Err(RetrievalError::Timeout {
                method: self.method(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Full-text search over the Tantivy keyword index
pub struct FtsAdapter {
    index: Arc<RwLock<KeywordIndex>>,
}

impl FtsAdapter {
    pub fn new(index: Arc<RwLock<KeywordIndex>>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl RetrievalAdapter for FtsAdapter {
    fn method(&self) -> RetrievalMethod {
        RetrievalMethod::Fts
    }

    async fn retrieve(
        &self,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let index = Arc::clone(&self.index);
        let text = query.text.clone();

        let hits = tokio::task::spawn_blocking(move || index.blocking_read().search(&text, limit))
            .await
            .map_err(|e| RetrievalError::unavailable(RetrievalMethod::Fts, e))?
            .map_err(|e| RetrievalError::unavailable(RetrievalMethod::Fts, e))?;

        Ok(Candidate::ranked(hits.into_iter().map(|h| (h.id, h.score))))
    }
}

/// Cosine similarity between the embedded query and stored document vectors
pub struct DenseAdapter {
    provider: Arc<dyn EmbeddingProvider>,
    index: Arc<VectorIndex>,
}

impl DenseAdapter {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, index: Arc<VectorIndex>) -> Self {
        Self { provider, index }
    }
}

#[async_trait]
impl RetrievalAdapter for DenseAdapter {
    fn method(&self) -> RetrievalMethod {
        RetrievalMethod::Dense
    }

    async fn retrieve(
        &self,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let provider = Arc::clone(&self.provider);
        let index = Arc::clone(&self.index);
        let text = query.text.clone();

        // Embedding and the index scan both run on the blocking pool
        let hits = tokio::task::spawn_blocking(move || {
            let embedding = provider
                .embed(&text)
                .map_err(|e| RetrievalError::unavailable(RetrievalMethod::Dense, e))?;
            index
                .search(&embedding, limit)
                .map_err(|e| RetrievalError::unavailable(RetrievalMethod::Dense, e))
        })
        .await
        .map_err(|e| RetrievalError::unavailable(RetrievalMethod::Dense, e))??;

        Ok(Candidate::ranked(hits.into_iter().map(|h| (h.id, h.score))))
    }
}

/// Dot product between lexical-weight vectors
pub struct SparseAdapter {
    encoder: Arc<dyn LexicalEncoder>,
    index: Arc<SparseIndex>,
}

impl SparseAdapter {
    pub fn new(encoder: Arc<dyn LexicalEncoder>, index: Arc<SparseIndex>) -> Self {
        Self { encoder, index }
    }
}

#[async_trait]
impl RetrievalAdapter for SparseAdapter {
    fn method(&self) -> RetrievalMethod {
        RetrievalMethod::Sparse
    }

    async fn retrieve(
        &self,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let encoder = Arc::clone(&self.encoder);
        let index = Arc::clone(&self.index);
        let text = query.text.clone();

        let hits = tokio::task::spawn_blocking(move || {
            let weights = encoder
                .encode(&text)
                .map_err(|e| RetrievalError::unavailable(RetrievalMethod::Sparse, e))?;
            index
                .search(&weights, limit)
                .map_err(|e| RetrievalError::unavailable(RetrievalMethod::Sparse, e))
        })
        .await
        .map_err(|e| RetrievalError::unavailable(RetrievalMethod::Sparse, e))??;

        Ok(Candidate::ranked(hits.into_iter().map(|h| (h.id, h.score))))
    }
}
