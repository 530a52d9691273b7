//! Batch loader that fills every retrieval backend from one document set
use super::{
    EmbeddingError, EmbeddingProvider, KeywordIndex, LexicalEncoder, SparseIndex, VectorIndex,
};
use crate::retrieval::{Document, MemoryDocumentStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Result of batch processing
#[derive(Debug)]
pub struct BatchResult {
    pub processed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Batch processor for corpus indexing
///
/// Writes each document to the document store, the keyword index and the
/// sparse index, and embeds it into the vector index when a provider is
/// attached. A chunk whose embedding call fails is counted as failed and
/// skipped as a whole, so all backends stay consistent.
pub struct BatchProcessor {
    keyword_index: Arc<RwLock<KeywordIndex>>,
    sparse_index: Arc<SparseIndex>,
    encoder: Arc<dyn LexicalEncoder>,
    documents: Arc<MemoryDocumentStore>,
    dense: Option<(Arc<dyn EmbeddingProvider>, Arc<VectorIndex>)>,
    batch_size: usize,
}

impl BatchProcessor {
    pub fn new(
        keyword_index: Arc<RwLock<KeywordIndex>>,
        sparse_index: Arc<SparseIndex>,
        encoder: Arc<dyn LexicalEncoder>,
        documents: Arc<MemoryDocumentStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            keyword_index,
            sparse_index,
            encoder,
            documents,
            dense: None,
            batch_size: batch_size.max(1),
        }
    }

    /// Also embed documents into `vector_index` using `provider`
    pub fn with_dense(
        mut self,
        provider: Arc<dyn EmbeddingProvider>,
        vector_index: Arc<VectorIndex>,
    ) -> Self {
        self.dense = Some((provider, vector_index));
        self
    }

    /// Index all documents and commit the keyword index
    pub async fn process(&self, documents: Vec<Document>) -> Result<BatchResult> {
        let start = std::time::Instant::now();
        let total = documents.len();

        info!("Starting batch indexing of {} documents", total);

        let mut processed = 0;
        let mut failed = 0;

        for chunk in documents.chunks(self.batch_size) {
            match self.process_chunk(chunk).await {
                Ok(count) => {
                    processed += count;
                    debug!("Indexed chunk of {} documents", count);
                }
                Err(e) => {
                    warn!("Failed to index chunk: {}", e);
                    failed += chunk.len();
                }
            }
        }

        let mut keyword_index = self.keyword_index.write().await;
        keyword_index
            .commit()
            .context("Failed to commit keyword index")?;

        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Batch indexing complete: {} processed, {} failed, {}ms",
            processed, failed, duration_ms
        );

        Ok(BatchResult {
            processed,
            failed,
            duration_ms,
        })
    }

    async fn process_chunk(&self, chunk: &[Document]) -> Result<usize> {
        let embeddings = match &self.dense {
            Some((provider, _)) => {
                let provider = Arc::clone(provider);
                let texts: Vec<String> = chunk.iter().map(Document::text).collect();
                let embeddings = tokio::task::spawn_blocking(move || provider.embed_batch(&texts))
                    .await
                    .context("Embedding task panicked")??;
                if embeddings.len() != chunk.len() {
                    return Err(EmbeddingError::GenerationError(format!(
                        "Embedding count mismatch: expected {}, got {}",
                        chunk.len(),
                        embeddings.len()
                    ))
                    .into());
                }
                Some(embeddings)
            }
            None => None,
        };

        let sparse_vectors = chunk
            .iter()
            .map(|doc| self.encoder.encode(&doc.text()))
            .collect::<Result<Vec<_>, EmbeddingError>>()?;

        if let (Some((_, vector_index)), Some(embeddings)) = (&self.dense, embeddings) {
            let items: Vec<(String, Vec<f32>)> = chunk
                .iter()
                .map(|doc| doc.id.clone())
                .zip(embeddings)
                .collect();
            vector_index.insert_batch(&items)?;
        }

        for (doc, vector) in chunk.iter().zip(sparse_vectors) {
            self.sparse_index.insert(doc.id.clone(), vector)?;
        }

        let mut keyword_index = self.keyword_index.write().await;
        for doc in chunk {
            keyword_index.insert(&doc.id, &doc.title, &doc.body)?;
            self.documents.insert(doc.clone())?;
        }

        Ok(chunk.len())
    }
}
