//! Integration tests: hybrid retrieval, fusion, reranking and degraded mode
//!
//! External collaborators (embedding model, cross-encoder, slow or broken
//! backends) are replaced by in-process fakes so the pipeline runs without
//! model downloads.

use async_trait::async_trait;
use sift::embedding::{
    BatchProcessor, EmbeddingError, EmbeddingProvider, FastEmbedProvider, KeywordIndex,
    LexicalEncoder, SparseIndex, TermWeightEncoder, VectorIndex,
};
use sift::retrieval::{
    Candidate, CrossEncoder, CrossEncoderError, DenseAdapter, Device, Document, DocumentStore,
    FastEmbedCrossEncoder, FtsAdapter, FusionEngine, MemoryDocumentStore, MemoryRerankCache,
    Query, RerankEngine, RerankOptions, RetrievalAdapter, RetrievalError, RetrievalMethod,
    SearchConfig, SearchError, SearchOrchestrator, SparseAdapter,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Returns a fixed ranking after an optional delay, or fails
struct ScriptedAdapter {
    method: RetrievalMethod,
    ids: Vec<String>,
    delay: Duration,
    fail: bool,
    requested_limits: Mutex<Vec<usize>>,
}

impl ScriptedAdapter {
    fn new(method: RetrievalMethod, ids: &[&str]) -> Self {
        Self {
            method,
            ids: ids.iter().map(|s| s.to_string()).collect(),
            delay: Duration::ZERO,
            fail: false,
            requested_limits: Mutex::new(Vec::new()),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn broken(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl RetrievalAdapter for ScriptedAdapter {
    fn method(&self) -> RetrievalMethod {
        self.method
    }

    async fn retrieve(
        &self,
        _query: &Query,
        limit: usize,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        self.requested_limits.lock().unwrap().push(limit);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(RetrievalError::unavailable(self.method, "backend offline"));
        }
        Ok(Candidate::ranked(
            self.ids.iter().take(limit).map(|id| (id.clone(), 1.0)),
        ))
    }
}

/// Scores a pair by how many query words its text contains
struct OverlapCrossEncoder {
    device: Device,
    delay: Duration,
    oom_on_accelerator: bool,
    score_calls: AtomicUsize,
    cpu_calls: AtomicUsize,
}

impl OverlapCrossEncoder {
    fn new() -> Self {
        Self {
            device: Device::Cpu,
            delay: Duration::ZERO,
            oom_on_accelerator: false,
            score_calls: AtomicUsize::new(0),
            cpu_calls: AtomicUsize::new(0),
        }
    }
}

impl CrossEncoder for OverlapCrossEncoder {
    fn initialize(&self) -> Result<Device, CrossEncoderError> {
        Ok(self.device)
    }

    fn score(
        &self,
        pairs: &[(String, String)],
        device: Device,
    ) -> Result<Vec<f32>, CrossEncoderError> {
        self.score_calls.fetch_add(1, Ordering::SeqCst);
        if device == Device::Cpu {
            self.cpu_calls.fetch_add(1, Ordering::SeqCst);
        }
        if device == Device::Accelerator && self.oom_on_accelerator {
            return Err(CrossEncoderError::ResourceExhausted {
                device,
                detail: "out of memory".to_string(),
            });
        }
        std::thread::sleep(self.delay);

        Ok(pairs
            .iter()
            .map(|(query, text)| {
                let text = text.to_lowercase();
                query
                    .to_lowercase()
                    .split_whitespace()
                    .filter(|w| text.contains(*w))
                    .count() as f32
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "overlap"
    }
}

/// Deterministic embedder over a tiny fixed vocabulary
struct VocabularyEmbedder;

const VOCABULARY: [&str; 4] = ["rust", "memory", "python", "garbage"];

impl EmbeddingProvider for VocabularyEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.to_lowercase();
        Ok(VOCABULARY
            .iter()
            .map(|word| text.matches(word).count() as f32)
            .collect())
    }

    fn dimension(&self) -> usize {
        VOCABULARY.len()
    }

    fn model_name(&self) -> &str {
        "vocabulary"
    }
}

fn ids(response: &sift::retrieval::SearchResponse) -> Vec<&str> {
    response.results.iter().map(|r| r.id.as_str()).collect()
}

fn store(docs: &[(&str, &str)]) -> Arc<MemoryDocumentStore> {
    let store = MemoryDocumentStore::new();
    for (id, body) in docs {
        store.insert(Document::new(*id, "", *body)).unwrap();
    }
    Arc::new(store)
}

fn scripted(adapter: ScriptedAdapter) -> Arc<dyn RetrievalAdapter> {
    Arc::new(adapter)
}

fn methods(methods: &[RetrievalMethod]) -> SearchConfig {
    SearchConfig {
        enabled_methods: methods.iter().copied().collect(),
        ..SearchConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Fusion through the orchestrator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_method_scenario() {
    let orchestrator = SearchOrchestrator::new(
        vec![
            scripted(ScriptedAdapter::new(RetrievalMethod::Fts, &["2", "1", "3"])),
            scripted(ScriptedAdapter::new(RetrievalMethod::Dense, &["1", "3", "2"])),
        ],
        FusionEngine::default(),
    );

    let mut config = methods(&[RetrievalMethod::Fts, RetrievalMethod::Dense]);
    config.method_weights = [(RetrievalMethod::Fts, 0.5), (RetrievalMethod::Dense, 0.5)]
        .into_iter()
        .collect();

    let response = orchestrator
        .search(&Query::new("anything", 3), &config)
        .await
        .unwrap();

    let doc1 = 0.5 / 61.0 + 0.5 / 60.0;
    let doc2 = 0.5 / 60.0 + 0.5 / 62.0;
    let doc3 = 0.5 / 62.0 + 0.5 / 61.0;

    assert_eq!(ids(&response), vec!["1", "2", "3"]);
    assert!((response.results[0].score - doc1).abs() < 1e-12);
    assert!((response.results[1].score - doc2).abs() < 1e-12);
    assert!((response.results[2].score - doc3).abs() < 1e-12);
    assert!(!response.degraded);
    assert!(response.failed_methods.is_empty());
    assert_eq!(
        response.results[0].contributing_methods,
        vec![RetrievalMethod::Fts, RetrievalMethod::Dense]
    );
}

#[tokio::test]
async fn test_query_weights_override_config() {
    let orchestrator = SearchOrchestrator::new(
        vec![
            scripted(ScriptedAdapter::new(RetrievalMethod::Fts, &["keyword-doc"])),
            scripted(ScriptedAdapter::new(RetrievalMethod::Dense, &["semantic-doc"])),
        ],
        FusionEngine::default(),
    );
    let config = methods(&[RetrievalMethod::Fts, RetrievalMethod::Dense]);

    let query = Query::new("q", 2)
        .with_weight(RetrievalMethod::Dense, 0.7)
        .with_weight(RetrievalMethod::Fts, 0.3);
    let response = orchestrator.search(&query, &config).await.unwrap();
    assert_eq!(ids(&response), vec!["semantic-doc", "keyword-doc"]);

    let query = Query::new("q", 2).with_weight(RetrievalMethod::Dense, 0.1);
    let response = orchestrator.search(&query, &config).await.unwrap();
    assert_eq!(ids(&response), vec!["keyword-doc", "semantic-doc"]);
}

#[tokio::test]
async fn test_adapters_are_asked_to_over_fetch() {
    let adapter = Arc::new(ScriptedAdapter::new(RetrievalMethod::Fts, &["a", "b"]));
    let orchestrator = SearchOrchestrator::new(
        vec![Arc::clone(&adapter) as Arc<dyn RetrievalAdapter>],
        FusionEngine::default(),
    );

    let mut config = methods(&[RetrievalMethod::Fts]);
    config.search_multiplier = 3;

    orchestrator
        .search(&Query::new("q", 4), &config)
        .await
        .unwrap();

    assert_eq!(*adapter.requested_limits.lock().unwrap(), vec![12]);
}

#[tokio::test]
async fn test_filters_use_document_metadata() {
    let documents = MemoryDocumentStore::new();
    documents
        .insert(Document::new("en-1", "", "rust").with_metadata("lang", "en"))
        .unwrap();
    documents
        .insert(Document::new("de-1", "", "rust").with_metadata("lang", "de"))
        .unwrap();
    documents.insert(Document::new("none", "", "rust")).unwrap();

    let orchestrator = SearchOrchestrator::new(
        vec![scripted(ScriptedAdapter::new(
            RetrievalMethod::Fts,
            &["de-1", "none", "en-1"],
        ))],
        FusionEngine::default(),
    )
    .with_documents(Arc::new(documents));

    let response = orchestrator
        .search(
            &Query::new("rust", 10).with_filter("lang", "en"),
            &methods(&[RetrievalMethod::Fts]),
        )
        .await
        .unwrap();

    assert_eq!(ids(&response), vec!["en-1"]);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_degraded_mode_on_timeout() {
    let orchestrator = SearchOrchestrator::new(
        vec![
            scripted(ScriptedAdapter::new(RetrievalMethod::Fts, &["a", "b"])),
            scripted(
                ScriptedAdapter::new(RetrievalMethod::Dense, &["c"]).slow(Duration::from_secs(5)),
            ),
            scripted(ScriptedAdapter::new(RetrievalMethod::Sparse, &["b", "a"])),
        ],
        FusionEngine::default(),
    );

    let mut config = SearchConfig::default();
    config.per_method_timeout = Duration::from_millis(50);

    let started = std::time::Instant::now();
    let response = orchestrator
        .search(&Query::new("q", 10), &config)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(response.degraded);
    assert_eq!(response.failed_methods, vec!["dense".to_string()]);
    assert!(!response.results.is_empty());
    assert!(!ids(&response).contains(&"c"));
    assert!(response.timing_ms.contains_key("dense"));
}

#[tokio::test]
async fn test_all_backends_unavailable() {
    let orchestrator = SearchOrchestrator::new(
        vec![
            scripted(ScriptedAdapter::new(RetrievalMethod::Sparse, &[]).broken()),
            scripted(ScriptedAdapter::new(RetrievalMethod::Fts, &[]).broken()),
            scripted(
                ScriptedAdapter::new(RetrievalMethod::Dense, &[]).slow(Duration::from_secs(5)),
            ),
        ],
        FusionEngine::default(),
    );

    let mut config = SearchConfig::default();
    config.per_method_timeout = Duration::from_millis(30);

    let err = orchestrator
        .search(&Query::new("q", 5), &config)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SearchError::AllBackendsUnavailable {
            failed: vec!["fts".to_string(), "dense".to_string(), "sparse".to_string()]
        }
    );
}

#[tokio::test]
async fn test_invalid_query_rejected_before_retrieval() {
    let adapter = Arc::new(ScriptedAdapter::new(RetrievalMethod::Fts, &["a"]));
    let orchestrator = SearchOrchestrator::new(
        vec![Arc::clone(&adapter) as Arc<dyn RetrievalAdapter>],
        FusionEngine::default(),
    );
    let config = methods(&[RetrievalMethod::Fts]);

    for query in [Query::new("", 5), Query::new("rust", 0)] {
        let err = orchestrator.search(&query, &config).await.unwrap_err();
        assert!(matches!(err, SearchError::InvalidQuery(_)));
    }
    assert!(adapter.requested_limits.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Reranking
// ---------------------------------------------------------------------------

fn rerank_fixture(
    encoder: Arc<OverlapCrossEncoder>,
    timeout: Duration,
) -> SearchOrchestrator {
    let documents = store(&[
        ("a", "unrelated text"),
        ("b", "rust memory safety"),
        ("c", "rust"),
        ("d", "tail document"),
    ]);
    let engine = RerankEngine::new(
        encoder,
        RerankOptions {
            timeout,
            max_text_chars: 512,
        },
    );

    SearchOrchestrator::new(
        vec![scripted(ScriptedAdapter::new(
            RetrievalMethod::Fts,
            &["a", "c", "b", "d"],
        ))],
        FusionEngine::default(),
    )
    .with_documents(documents)
    .with_reranker(Arc::new(engine))
}

fn rerank_config(top_n: usize) -> SearchConfig {
    SearchConfig {
        rerank: true,
        rerank_top_n: top_n,
        ..methods(&[RetrievalMethod::Fts])
    }
}

#[tokio::test]
async fn test_rerank_reorders_shortlist_and_keeps_tail() {
    let encoder = Arc::new(OverlapCrossEncoder::new());
    let orchestrator = rerank_fixture(Arc::clone(&encoder), Duration::from_secs(5));

    let response = orchestrator
        .search(&Query::new("rust memory", 10), &rerank_config(3))
        .await
        .unwrap();

    assert!(response.reranked);
    assert_eq!(ids(&response), vec!["b", "c", "a", "d"]);
    assert_eq!(response.results[0].rerank_score, Some(2.0));
    assert_eq!(response.results[3].rerank_score, None);
    assert!(response.timing_ms.contains_key("rerank"));
}

#[tokio::test]
async fn test_rerank_timeout_keeps_fused_order() {
    let mut encoder = OverlapCrossEncoder::new();
    encoder.delay = Duration::from_millis(500);
    let orchestrator = rerank_fixture(Arc::new(encoder), Duration::from_millis(20));

    let response = orchestrator
        .search(&Query::new("rust memory", 10), &rerank_config(4))
        .await
        .unwrap();

    assert!(!response.reranked);
    assert!(!response.degraded);
    assert_eq!(ids(&response), vec!["a", "c", "b", "d"]);
    assert!(response.results.iter().all(|r| r.rerank_score.is_none()));
}

#[tokio::test]
async fn test_rerank_accelerator_oom_retries_on_cpu() {
    let mut encoder = OverlapCrossEncoder::new();
    encoder.device = Device::Accelerator;
    encoder.oom_on_accelerator = true;
    let encoder = Arc::new(encoder);
    let orchestrator = rerank_fixture(Arc::clone(&encoder), Duration::from_secs(5));

    let response = orchestrator
        .search(&Query::new("rust memory", 10), &rerank_config(4))
        .await
        .unwrap();

    assert!(response.reranked);
    assert_eq!(response.results[0].id, "b");
    assert_eq!(encoder.score_calls.load(Ordering::SeqCst), 2);
    assert_eq!(encoder.cpu_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rerank_cache_reused_across_searches() {
    let encoder = Arc::new(OverlapCrossEncoder::new());
    let cache = Arc::new(MemoryRerankCache::new());
    let orchestrator = rerank_fixture(Arc::clone(&encoder), Duration::from_secs(5))
        .with_cache(Arc::clone(&cache) as Arc<dyn sift::retrieval::CacheStore>);

    let first = orchestrator
        .search(&Query::new("rust memory", 10), &rerank_config(4))
        .await
        .unwrap();
    let second = orchestrator
        .search(&Query::new("rust memory", 2), &rerank_config(4))
        .await
        .unwrap();

    assert_eq!(encoder.score_calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(ids(&second), ids(&first)[..2].to_vec());
}

#[tokio::test]
async fn test_rerank_without_documents_is_skipped() {
    let engine = RerankEngine::new(Arc::new(OverlapCrossEncoder::new()), RerankOptions::default());
    let orchestrator = SearchOrchestrator::new(
        vec![scripted(ScriptedAdapter::new(RetrievalMethod::Fts, &["x", "y"]))],
        FusionEngine::default(),
    )
    .with_reranker(Arc::new(engine));

    let response = orchestrator
        .search(&Query::new("q", 5), &rerank_config(5))
        .await
        .unwrap();

    assert!(!response.reranked);
    assert_eq!(ids(&response), vec!["x", "y"]);
}

// ---------------------------------------------------------------------------
// Real backends
// ---------------------------------------------------------------------------

fn corpus() -> Vec<Document> {
    vec![
        Document::new("rust-ownership", "Rust ownership", "Rust guarantees memory safety without a garbage collector")
            .with_metadata("lang", "rust"),
        Document::new("python-gc", "Python memory", "Python relies on reference counting and a garbage collector")
            .with_metadata("lang", "python"),
        Document::new("rust-async", "Async Rust", "Futures and executors in Rust")
            .with_metadata("lang", "rust"),
        Document::new("cooking", "Bread", "Flour water salt and yeast"),
    ]
}

#[tokio::test]
async fn test_hybrid_search_over_real_indexes() {
    let keyword_index = Arc::new(RwLock::new(KeywordIndex::in_memory().unwrap()));
    let sparse_index = Arc::new(SparseIndex::new());
    let encoder: Arc<dyn LexicalEncoder> = Arc::new(TermWeightEncoder::new().unwrap());
    let documents = Arc::new(MemoryDocumentStore::new());
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(VocabularyEmbedder);
    let vector_index = Arc::new(VectorIndex::new(provider.dimension()));

    let result = BatchProcessor::new(
        Arc::clone(&keyword_index),
        Arc::clone(&sparse_index),
        Arc::clone(&encoder),
        Arc::clone(&documents),
        2,
    )
    .with_dense(Arc::clone(&provider), Arc::clone(&vector_index))
    .process(corpus())
    .await
    .unwrap();

    assert_eq!(result.processed, 4);
    assert_eq!(result.failed, 0);

    let adapters: Vec<Arc<dyn RetrievalAdapter>> = vec![
        Arc::new(FtsAdapter::new(keyword_index)),
        Arc::new(DenseAdapter::new(provider, vector_index)),
        Arc::new(SparseAdapter::new(encoder, sparse_index)),
    ];
    let orchestrator = SearchOrchestrator::new(adapters, FusionEngine::default())
    .with_documents(documents.clone() as Arc<dyn DocumentStore>);

    let response = orchestrator
        .search(&Query::new("rust memory safety", 3), &SearchConfig::default())
        .await
        .unwrap();

    assert!(!response.degraded);
    assert_eq!(response.results[0].id, "rust-ownership");
    assert_eq!(response.results[0].contributing_methods.len(), 3);
    assert!(!ids(&response).contains(&"cooking"));

    let filtered = orchestrator
        .search(
            &Query::new("garbage collector", 5).with_filter("lang", "python"),
            &SearchConfig::default(),
        )
        .await
        .unwrap();
    assert_eq!(ids(&filtered), vec!["python-gc"]);
}

#[tokio::test]
#[ignore] // Requires model download
async fn test_hybrid_search_with_fastembed_models() {
    println!("\n=== Hybrid search with FastEmbed models ===\n");

    let keyword_index = Arc::new(RwLock::new(KeywordIndex::in_memory().unwrap()));
    let sparse_index = Arc::new(SparseIndex::new());
    let encoder: Arc<dyn LexicalEncoder> = Arc::new(TermWeightEncoder::new().unwrap());
    let documents = Arc::new(MemoryDocumentStore::new());

    let provider: Arc<dyn EmbeddingProvider> =
        Arc::new(FastEmbedProvider::with_default_model().unwrap());
    let vector_index = Arc::new(VectorIndex::new(provider.dimension()));
    println!("✓ Embedding provider initialized ({}D)", provider.dimension());

    BatchProcessor::new(
        Arc::clone(&keyword_index),
        Arc::clone(&sparse_index),
        Arc::clone(&encoder),
        Arc::clone(&documents),
        8,
    )
    .with_dense(Arc::clone(&provider), Arc::clone(&vector_index))
    .process(corpus())
    .await
    .unwrap();
    println!("✓ Corpus indexed");

    let reranker = RerankEngine::new(
        Arc::new(FastEmbedCrossEncoder::with_default_model().unwrap()),
        RerankOptions {
            timeout: Duration::from_secs(60),
            max_text_chars: 512,
        },
    );

    let adapters: Vec<Arc<dyn RetrievalAdapter>> = vec![
        Arc::new(FtsAdapter::new(keyword_index)),
        Arc::new(DenseAdapter::new(provider, vector_index)),
        Arc::new(SparseAdapter::new(encoder, sparse_index)),
    ];
    let orchestrator = SearchOrchestrator::new(adapters, FusionEngine::default())
    .with_documents(documents)
    .with_reranker(Arc::new(reranker));

    let mut config = SearchConfig::default();
    config.per_method_timeout = Duration::from_secs(30);
    config.rerank = true;

    let response = orchestrator
        .search(&Query::new("how does rust manage memory", 3), &config)
        .await
        .unwrap();

    for (i, result) in response.results.iter().enumerate() {
        println!("  {}. {} ({:.4})", i + 1, result.id, result.score);
    }

    assert!(response.reranked);
    assert_eq!(response.results[0].id, "rust-ownership");

    let timing: HashMap<_, _> = response.timing_ms.into_iter().collect();
    println!("✓ Timings: {:?}", timing);
}
