//! Concurrent hybrid search: fan out, fuse, filter, rerank

use crate::retrieval::{
    CacheStore, CandidateWithText, DocumentStore, FusedResult, FusionEngine, Query, RankedList,
    RerankEngine, RerankedResult, RetrievalAdapter, RetrievalError, RetrievalMethod,
    ScoredCandidate, SearchConfig, SearchResponse,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("All retrieval backends unavailable: {}", failed.join(", "))]
    AllBackendsUnavailable { failed: Vec<String> },
}

/// Runs the enabled retrieval adapters concurrently and merges their output
///
/// A failing or slow adapter degrades the response instead of failing it;
/// only when every enabled adapter fails does the search return an error.
pub struct SearchOrchestrator {
    adapters: Vec<Arc<dyn RetrievalAdapter>>,
    fusion: FusionEngine,
    reranker: Option<Arc<RerankEngine>>,
    documents: Option<Arc<dyn DocumentStore>>,
    cache: Option<Arc<dyn CacheStore>>,
}

impl SearchOrchestrator {
    pub fn new(adapters: Vec<Arc<dyn RetrievalAdapter>>, fusion: FusionEngine) -> Self {
        Self {
            adapters,
            fusion,
            reranker: None,
            documents: None,
            cache: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<RerankEngine>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Document store used for metadata filters and rerank text
    pub fn with_documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Perform hybrid search
    pub async fn search(
        &self,
        query: &Query,
        config: &SearchConfig,
    ) -> Result<SearchResponse, SearchError> {
        let started = Instant::now();
        query.validate().map_err(SearchError::InvalidQuery)?;

        if config.enabled_methods.is_empty() {
            return Err(SearchError::InvalidQuery(
                "No retrieval methods enabled".to_string(),
            ));
        }

        let mut timing_ms: BTreeMap<String, u64> = BTreeMap::new();

        // Step 1: Fan out to every enabled adapter
        let search_limit = query.limit.saturating_mul(config.search_multiplier.max(1));
        let (lists, failed_methods) = self
            .retrieve_all(query, config, search_limit, &mut timing_ms)
            .await;

        if lists.is_empty() {
            warn!(failed = ?failed_methods, "Every retrieval method failed");
            return Err(SearchError::AllBackendsUnavailable {
                failed: failed_methods,
            });
        }

        let degraded = !failed_methods.is_empty();
        if degraded {
            warn!(failed = ?failed_methods, "Serving degraded results");
        }

        // Step 2: Weighted Reciprocal Rank Fusion
        let fusion_started = Instant::now();
        let weights: HashMap<RetrievalMethod, f32> = RetrievalMethod::ALL
            .into_iter()
            .map(|m| (m, config.weight_for(query, m)))
            .collect();
        let mut fused = self.fusion.fuse(&lists, &weights);
        timing_ms.insert("fusion".to_string(), elapsed_ms(fusion_started));

        // Step 3: Apply filters if specified
        if !query.filters.is_empty() {
            match &self.documents {
                Some(documents) => fused.retain(|r| {
                    documents
                        .get(&r.id)
                        .map(|doc| doc.matches(&query.filters))
                        .unwrap_or(false)
                }),
                None => warn!("Query has filters but no document store is attached, ignoring them"),
            }
        }

        // Step 4: Rerank the head of the fused list if enabled
        let rerank_attempted = config.rerank && config.rerank_top_n > 0 && !fused.is_empty();
        let (mut results, reranked) = if rerank_attempted {
            let rerank_started = Instant::now();
            let outcome = self.rerank_fused(query, config, fused).await;
            timing_ms.insert("rerank".to_string(), elapsed_ms(rerank_started));
            outcome
        } else {
            (fused.iter().map(ScoredCandidate::from_fused).collect(), false)
        };

        results.truncate(query.limit);
        timing_ms.insert("total".to_string(), elapsed_ms(started));

        info!(
            query = %query.text,
            results = results.len(),
            degraded,
            reranked,
            total_ms = timing_ms.get("total").copied().unwrap_or(0),
            "Search completed"
        );

        Ok(SearchResponse {
            results,
            degraded,
            failed_methods,
            reranked,
            timing_ms,
        })
    }

    /// Run adapters concurrently; returns the successful lists and the
    /// sorted names of the methods that failed
    async fn retrieve_all(
        &self,
        query: &Query,
        config: &SearchConfig,
        limit: usize,
        timing_ms: &mut BTreeMap<String, u64>,
    ) -> (Vec<RankedList>, Vec<String>) {
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<RetrievalMethod> = BTreeSet::new();

        for method in &config.enabled_methods {
            let Some(adapter) = self.adapters.iter().find(|a| a.method() == *method) else {
                continue;
            };
            pending.insert(*method);

            let adapter = Arc::clone(adapter);
            let query = query.clone();
            let timeout = config.per_method_timeout;
            tasks.spawn(async move {
                let started = Instant::now();
                let result = adapter.retrieve_with_timeout(&query, limit, timeout).await;
                (adapter.method(), elapsed_ms(started), result)
            });
        }

        let mut lists = Vec::new();
        let mut failed: BTreeSet<RetrievalMethod> = BTreeSet::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((method, took, result)) => {
                    pending.remove(&method);
                    timing_ms.insert(method.to_string(), took);
                    match result {
                        Ok(candidates) => {
                            debug!(%method, candidates = candidates.len(), took_ms = took, "Retrieval finished");
                            lists.push(RankedList::new(method, candidates));
                        }
                        Err(err) => {
                            log_retrieval_failure(&err);
                            failed.insert(method);
                        }
                    }
                }
                Err(err) => warn!(error = %err, "Retrieval task aborted"),
            }
        }

        // Aborted tasks never reported back; enabled methods without an
        // adapter never ran
        for method in &config.enabled_methods {
            let ran = self.adapters.iter().any(|a| a.method() == *method);
            if !ran {
                warn!(%method, "No adapter registered for enabled method");
                failed.insert(*method);
            }
        }
        failed.extend(pending);

        let failed = failed.into_iter().map(|m| m.to_string()).collect();
        (lists, failed)
    }

    /// Rerank the top `rerank_top_n` fused candidates; any failure keeps the
    /// fused order
    async fn rerank_fused(
        &self,
        query: &Query,
        config: &SearchConfig,
        fused: Vec<FusedResult>,
    ) -> (Vec<ScoredCandidate>, bool) {
        let fallback = |fused: &[FusedResult]| -> (Vec<ScoredCandidate>, bool) {
            (fused.iter().map(ScoredCandidate::from_fused).collect(), false)
        };

        let (Some(reranker), Some(documents)) = (&self.reranker, &self.documents) else {
            warn!("Reranking requested but no reranker or document store is attached");
            return fallback(&fused);
        };

        let shortlist_len = config.rerank_top_n.min(fused.len());
        let shortlist: Vec<CandidateWithText> = fused[..shortlist_len]
            .iter()
            .map(|r| {
                let text = documents.get(&r.id).map(|d| d.text()).unwrap_or_default();
                CandidateWithText::new(r.id.clone(), text)
            })
            .collect();

        let timeout: Duration = reranker.options().timeout;
        let outcome = match &self.cache {
            Some(cache) => {
                reranker
                    .rerank_with_cache(&query.text, &shortlist, shortlist_len, timeout, cache.as_ref())
                    .await
            }
            None => {
                reranker
                    .rerank(&query.text, &shortlist, shortlist_len, timeout)
                    .await
            }
        };

        let outcome = match outcome {
            Ok(outcome) if outcome.reranked => outcome,
            Ok(_) => return fallback(&fused),
            Err(err) => {
                warn!(error = %err, "Reranking failed, keeping fused order");
                return fallback(&fused);
            }
        };

        debug!(
            shortlist = shortlist_len,
            cache_hit = outcome.cache_hit,
            "Reranked fused shortlist"
        );

        let by_id: HashMap<&str, &FusedResult> =
            fused[..shortlist_len].iter().map(|r| (r.id.as_str(), r)).collect();

        let mut results: Vec<ScoredCandidate> = outcome
            .results
            .iter()
            .filter_map(|reranked| {
                by_id
                    .get(reranked.id.as_str())
                    .map(|fused| with_rerank_score(fused, reranked))
            })
            .collect();

        results.extend(fused[shortlist_len..].iter().map(ScoredCandidate::from_fused));
        (results, true)
    }
}

fn with_rerank_score(fused: &FusedResult, reranked: &RerankedResult) -> ScoredCandidate {
    let mut candidate = ScoredCandidate::from_fused(fused);
    candidate.score = reranked.rerank_score;
    candidate.rerank_score = Some(reranked.rerank_score);
    candidate
}

fn log_retrieval_failure(err: &RetrievalError) {
    match err {
        RetrievalError::Timeout { method, timeout_ms } => {
            warn!(%method, timeout_ms, "Retrieval method timed out")
        }
        RetrievalError::Unavailable { method, reason } => {
            warn!(%method, reason = %reason, "Retrieval method unavailable")
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{
        Candidate, CrossEncoder, CrossEncoderError, Device, Document, MemoryDocumentStore,
        RerankOptions,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedAdapter {
        method: RetrievalMethod,
        ids: Vec<&'static str>,
    }

    #[async_trait]
    impl RetrievalAdapter for FixedAdapter {
        fn method(&self) -> RetrievalMethod {
            self.method
        }

        async fn retrieve(
            &self,
            _query: &Query,
            limit: usize,
        ) -> Result<Vec<Candidate>, RetrievalError> {
            Ok(Candidate::ranked(
                self.ids.iter().take(limit).map(|id| (*id, 1.0)),
            ))
        }
    }

    struct BrokenAdapter(RetrievalMethod);

    #[async_trait]
    impl RetrievalAdapter for BrokenAdapter {
        fn method(&self) -> RetrievalMethod {
            self.0
        }

        async fn retrieve(
            &self,
            _query: &Query,
            _limit: usize,
        ) -> Result<Vec<Candidate>, RetrievalError> {
            Err(RetrievalError::unavailable(self.0, "index missing"))
        }
    }

    fn fixed(method: RetrievalMethod, ids: &[&'static str]) -> Arc<dyn RetrievalAdapter> {
        Arc::new(FixedAdapter {
            method,
            ids: ids.to_vec(),
        })
    }

    #[tokio::test]
    async fn test_single_method_keeps_order() {
        let orchestrator = SearchOrchestrator::new(
            vec![fixed(RetrievalMethod::Fts, &["c", "a", "b"])],
            FusionEngine::default(),
        );
        let mut config = SearchConfig::default();
        config.enabled_methods = [RetrievalMethod::Fts].into_iter().collect();

        let response = orchestrator
            .search(&Query::new("q", 10), &config)
            .await
            .unwrap();

        let ids: Vec<&str> = response.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(!response.degraded);
        assert!(!response.reranked);
        for key in ["fts", "fusion", "total"] {
            assert!(response.timing_ms.contains_key(key), "missing {}", key);
        }
        assert!(!response.timing_ms.contains_key("rerank"));
    }

    #[tokio::test]
    async fn test_failed_method_degrades() {
        let orchestrator = SearchOrchestrator::new(
            vec![
                fixed(RetrievalMethod::Fts, &["a"]),
                Arc::new(BrokenAdapter(RetrievalMethod::Dense)),
                fixed(RetrievalMethod::Sparse, &["a", "b"]),
            ],
            FusionEngine::default(),
        );

        let response = orchestrator
            .search(&Query::new("q", 10), &SearchConfig::default())
            .await
            .unwrap();

        assert!(response.degraded);
        assert_eq!(response.failed_methods, vec!["dense".to_string()]);
        assert_eq!(response.results[0].id, "a");
    }

    #[tokio::test]
    async fn test_missing_adapter_counts_as_failed() {
        let orchestrator = SearchOrchestrator::new(
            vec![fixed(RetrievalMethod::Fts, &["a"])],
            FusionEngine::default(),
        );

        let response = orchestrator
            .search(&Query::new("q", 10), &SearchConfig::default())
            .await
            .unwrap();

        assert_eq!(
            response.failed_methods,
            vec!["dense".to_string(), "sparse".to_string()]
        );
    }

    #[tokio::test]
    async fn test_limit_truncates() {
        let orchestrator = SearchOrchestrator::new(
            vec![fixed(RetrievalMethod::Fts, &["a", "b", "c", "d"])],
            FusionEngine::default(),
        );
        let mut config = SearchConfig::default();
        config.enabled_methods = [RetrievalMethod::Fts].into_iter().collect();

        let response = orchestrator
            .search(&Query::new("q", 2), &config)
            .await
            .unwrap();

        assert_eq!(response.results.len(), 2);
    }

    #[tokio::test]
    async fn test_no_enabled_methods_is_invalid() {
        let orchestrator = SearchOrchestrator::new(Vec::new(), FusionEngine::default());
        let mut config = SearchConfig::default();
        config.enabled_methods.clear();

        let err = orchestrator
            .search(&Query::new("q", 2), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::InvalidQuery(_)));
    }

    /// Scores every pair 1.0 and counts batches
    struct CountingEncoder {
        batches: AtomicUsize,
    }

    impl CrossEncoder for CountingEncoder {
        fn initialize(&self) -> Result<Device, CrossEncoderError> {
            Ok(Device::Cpu)
        }

        fn score(
            &self,
            pairs: &[(String, String)],
            _device: Device,
        ) -> Result<Vec<f32>, CrossEncoderError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1.0; pairs.len()])
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_empty_rerank_shortlist_is_not_a_rerank() {
        let store = Arc::new(MemoryDocumentStore::new());
        for id in ["a", "b"] {
            store.insert(Document::new(id, id, "body")).unwrap();
        }
        let encoder = Arc::new(CountingEncoder {
            batches: AtomicUsize::new(0),
        });
        let orchestrator = SearchOrchestrator::new(
            vec![fixed(RetrievalMethod::Fts, &["a", "b"])],
            FusionEngine::default(),
        )
        .with_documents(store)
        .with_reranker(Arc::new(RerankEngine::new(
            Arc::clone(&encoder) as Arc<dyn CrossEncoder>,
            RerankOptions::default(),
        )));

        let mut config = SearchConfig::default();
        config.enabled_methods = [RetrievalMethod::Fts].into_iter().collect();
        config.rerank = true;
        config.rerank_top_n = 0;

        let response = orchestrator
            .search(&Query::new("q", 10), &config)
            .await
            .unwrap();

        assert!(!response.reranked);
        assert!(!response.timing_ms.contains_key("rerank"));
        let ids: Vec<&str> = response.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(encoder.batches.load(Ordering::SeqCst), 0);
    }
}
