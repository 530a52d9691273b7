//! Cross-encoder reranking with caching, device fallback and a time budget

use crate::retrieval::{
    rerank_cache_key, CacheEntry, CacheStore, CrossEncoder, CrossEncoderError, Device,
    RerankedResult,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RerankError {
    #[error("Reranking timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Reranker resources exhausted: {detail}")]
    ResourceExhausted { detail: String },

    #[error("Reranker initialization failed: {0}")]
    InitializationError(String),

    #[error("Reranking failed: {0}")]
    RerankingError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<CrossEncoderError> for RerankError {
    fn from(err: CrossEncoderError) -> Self {
        match err {
            CrossEncoderError::Initialization(msg) => Self::InitializationError(msg),
            CrossEncoderError::ResourceExhausted { device, detail } => Self::ResourceExhausted {
                detail: format!("{}: {}", device, detail),
            },
            CrossEncoderError::Inference(msg) => Self::RerankingError(msg),
        }
    }
}

/// A fused candidate paired with the text the cross-encoder reads
#[derive(Debug, Clone)]
pub struct CandidateWithText {
    pub id: String,
    pub text: String,
}

impl CandidateWithText {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Reranking settings
#[derive(Debug, Clone)]
pub struct RerankOptions {
    /// Budget for one rerank call, covering a pending model load and the
    /// wait for the accelerator
    pub timeout: Duration,
    /// Candidate text is cut to this many characters before pairing
    pub max_text_chars: usize,
}

impl Default for RerankOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            max_text_chars: 512,
        }
    }
}

/// What a rerank call produced
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    /// Reranked candidates, at most `top_k`. When `reranked` is false these
    /// are the input candidates in their original order with zero scores.
    pub results: Vec<RerankedResult>,
    pub reranked: bool,
    pub cache_hit: bool,
}

impl RerankOutcome {
    fn passthrough(candidates: &[CandidateWithText], top_k: usize) -> Self {
        let results = candidates
            .iter()
            .take(top_k)
            .enumerate()
            .map(|(i, c)| RerankedResult {
                id: c.id.clone(),
                rerank_score: 0.0,
                original_rank: i + 1,
                new_rank: i + 1,
            })
            .collect();

        Self {
            results,
            reranked: false,
            cache_hit: false,
        }
    }
}

/// Re-scores fused candidates with a cross-encoder
///
/// The encoder is initialized lazily on the first call (or eagerly through
/// `initialize`) and the chosen device is kept for the engine's lifetime.
/// Accelerator batches are serialized through a process-wide lock; the CPU
/// path runs without it.
pub struct RerankEngine {
    encoder: Arc<dyn CrossEncoder>,
    options: RerankOptions,
    device: Arc<OnceCell<Device>>,
    accelerator: Arc<Mutex<()>>,
}

/// Shared by every engine in the process
fn accelerator_lock() -> Arc<Mutex<()>> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    Arc::clone(LOCK.get_or_init(|| Arc::new(Mutex::new(()))))
}

impl RerankEngine {
    pub fn new(encoder: Arc<dyn CrossEncoder>, options: RerankOptions) -> Self {
        Self {
            encoder,
            options,
            device: Arc::new(OnceCell::new()),
            accelerator: accelerator_lock(),
        }
    }

    pub fn options(&self) -> &RerankOptions {
        &self.options
    }

    pub fn model_name(&self) -> &str {
        self.encoder.model_name()
    }

    /// Load the model and select its device. Idempotent.
    ///
    /// The load runs in its own task: a caller that stops waiting leaves it
    /// running, and later calls wait on the same load instead of starting
    /// another. A failed load is retried by the next call.
    pub async fn initialize(&self) -> Result<Device, RerankError> {
        if let Some(device) = self.device.get() {
            return Ok(*device);
        }

        let cell = Arc::clone(&self.device);
        let encoder = Arc::clone(&self.encoder);

        tokio::spawn(async move {
            cell.get_or_try_init(|| async {
                let loader = Arc::clone(&encoder);
                let device = tokio::task::spawn_blocking(move || loader.initialize())
                    .await
                    .map_err(|e| RerankError::InitializationError(e.to_string()))??;
                info!(
                    model = encoder.model_name(),
                    %device,
                    "Cross-encoder initialized"
                );
                Ok::<Device, RerankError>(device)
            })
            .await
            .copied()
        })
        .await
        .map_err(|e| RerankError::InitializationError(e.to_string()))?
    }

    /// Rerank `candidates` for `query` and keep the best `top_k`.
    ///
    /// When scoring does not finish within `timeout`, the candidates come
    /// back in their input order with `reranked = false` instead of an error.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[CandidateWithText],
        top_k: usize,
        timeout: Duration,
    ) -> Result<RerankOutcome, RerankError> {
        match self.rerank_full(query, candidates, timeout).await {
            Ok(full) => Ok(RerankOutcome {
                results: truncated(full, top_k),
                reranked: true,
                cache_hit: false,
            }),
            Err(RerankError::Timeout { .. }) => Ok(RerankOutcome::passthrough(candidates, top_k)),
            Err(err) => Err(err),
        }
    }

    /// `rerank` memoized through `cache`.
    ///
    /// The cache holds the full reranked shortlist, keyed by the query text
    /// and the sorted candidate ids; timed-out calls are not cached.
    pub async fn rerank_with_cache(
        &self,
        query: &str,
        candidates: &[CandidateWithText],
        top_k: usize,
        timeout: Duration,
        cache: &dyn CacheStore,
    ) -> Result<RerankOutcome, RerankError> {
        let key = rerank_cache_key(query, candidates.iter().map(|c| c.id.as_str()));

        if let Some(entry) = cache.get(&key) {
            debug!(key = %key, "Rerank cache hit");
            return Ok(RerankOutcome {
                results: truncated(entry.value, top_k),
                reranked: true,
                cache_hit: true,
            });
        }

        debug!(key = %key, "Rerank cache miss");

        match self.rerank_full(query, candidates, timeout).await {
            Ok(full) => {
                cache.set(&key, CacheEntry::new(key.clone(), full.clone()));
                Ok(RerankOutcome {
                    results: truncated(full, top_k),
                    reranked: true,
                    cache_hit: false,
                })
            }
            Err(RerankError::Timeout { .. }) => Ok(RerankOutcome::passthrough(candidates, top_k)),
            Err(err) => Err(err),
        }
    }

    /// Score and sort every candidate within `timeout`
    async fn rerank_full(
        &self,
        query: &str,
        candidates: &[CandidateWithText],
        timeout: Duration,
    ) -> Result<Vec<RerankedResult>, RerankError> {
        if query.trim().is_empty() {
            return Err(RerankError::InvalidInput(
                "Query cannot be empty".to_string(),
            ));
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let pairs: Arc<Vec<(String, String)>> = Arc::new(
            candidates
                .iter()
                .map(|c| {
                    (
                        query.to_string(),
                        truncate_chars(&c.text, self.options.max_text_chars).to_string(),
                    )
                })
                .collect(),
        );

        let work = async {
            let device = self.initialize().await?;
            self.score_batch(pairs, device).await
        };

        let scores = match tokio::time::timeout(timeout, work).await {
            Ok(scores) => scores?,
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(
                    timeout_ms,
                    candidates = candidates.len(),
                    "Reranking timed out, keeping fused order"
                );
                return Err(RerankError::Timeout { timeout_ms });
            }
        };

        if scores.len() != candidates.len() {
            return Err(RerankError::RerankingError(format!(
                "Score count mismatch: expected {}, got {}",
                candidates.len(),
                scores.len()
            )));
        }

        let mut order: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Ok(order
            .into_iter()
            .enumerate()
            .map(|(position, (index, score))| RerankedResult {
                id: candidates[index].id.clone(),
                rerank_score: f64::from(score),
                original_rank: index + 1,
                new_rank: position + 1,
            })
            .collect())
    }

    async fn score_batch(
        &self,
        pairs: Arc<Vec<(String, String)>>,
        device: Device,
    ) -> Result<Vec<f32>, RerankError> {
        match device {
            Device::Accelerator => match self.score_on_accelerator(Arc::clone(&pairs)).await {
                Err(CrossEncoderError::ResourceExhausted { detail, .. }) => {
                    warn!(
                        detail = %detail,
                        pairs = pairs.len(),
                        "Accelerator out of memory, retrying batch on CPU"
                    );
                    Ok(self.score_on_cpu(pairs).await?)
                }
                other => Ok(other?),
            },
            Device::Cpu => Ok(self.score_on_cpu(pairs).await?),
        }
    }

    async fn score_on_accelerator(
        &self,
        pairs: Arc<Vec<(String, String)>>,
    ) -> Result<Vec<f32>, CrossEncoderError> {
        let guard = Arc::clone(&self.accelerator).lock_owned().await;
        let encoder = Arc::clone(&self.encoder);

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let result = encoder.score(&pairs, Device::Accelerator);
            if matches!(result, Err(CrossEncoderError::ResourceExhausted { .. })) {
                encoder.release(Device::Accelerator);
            }
            result
        })
        .await
        .map_err(|e| CrossEncoderError::Inference(e.to_string()))?
    }

    async fn score_on_cpu(
        &self,
        pairs: Arc<Vec<(String, String)>>,
    ) -> Result<Vec<f32>, CrossEncoderError> {
        let encoder = Arc::clone(&self.encoder);

        tokio::task::spawn_blocking(move || encoder.score(&pairs, Device::Cpu))
            .await
            .map_err(|e| CrossEncoderError::Inference(e.to_string()))?
    }
}

fn truncated(mut results: Vec<RerankedResult>, top_k: usize) -> Vec<RerankedResult> {
    results.truncate(top_k);
    results
}

/// Longest prefix of `text` with at most `max_chars` characters
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
