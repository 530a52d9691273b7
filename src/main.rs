use sift::cli::{Cli, Commands, ConfigAction};
use sift::config::Config;
use sift::embedding::{
    BatchProcessor, EmbeddingError, EmbeddingProvider, FastEmbedProvider, KeywordIndex, LexicalEncoder,
    SparseIndex, TermWeightEncoder, VectorIndex,
};
use sift::error::{Result, SiftError};
use sift::metrics::{evaluate_runs, EvaluationSummary, RankingJudgment};
use sift::retrieval::{
    DenseAdapter, Document, FastEmbedCrossEncoder, FtsAdapter, MemoryDocumentStore,
    MemoryRerankCache, Query, RerankEngine, RetrievalAdapter, RetrievalMethod, SearchOrchestrator,
    SearchResponse, SparseAdapter,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    // Handle commands
    match cli.command {
        Commands::Search {
            corpus,
            query,
            limit,
            methods,
            weights,
            filters,
            no_dense,
            rerank,
            profile,
            json,
        } => {
            let options = SearchOptions {
                limit,
                methods,
                weights,
                filters,
                no_dense,
                rerank,
                json,
            };
            cmd_search(cli.config, profile, &corpus, &query, options).await?;
        }
        Commands::Eval {
            runs,
            judgments,
            k,
            per_query,
            json,
        } => {
            cmd_eval(&runs, &judgments, k, per_query, json)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "sift=debug" } else { "sift=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Command-line adjustments applied on top of the loaded configuration
struct SearchOptions {
    limit: Option<usize>,
    methods: Vec<RetrievalMethod>,
    weights: Vec<(RetrievalMethod, f32)>,
    filters: Vec<(String, String)>,
    no_dense: bool,
    rerank: bool,
    json: bool,
}

async fn cmd_search(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    corpus: &Path,
    query_text: &str,
    options: SearchOptions,
) -> Result<()> {
    let mut config = load_config(config_path, profile)?;

    if !options.methods.is_empty() {
        config.retrieval.enabled_methods = options.methods.clone();
    }
    if options.no_dense {
        config
            .retrieval
            .enabled_methods
            .retain(|m| *m != RetrievalMethod::Dense);
    }
    if options.rerank {
        config.rerank.enabled = true;
    }

    let documents = load_corpus(corpus)?;
    tracing::info!("Loaded {} documents from {:?}", documents.len(), corpus);

    // Build the indexes
    let keyword_index = Arc::new(RwLock::new(
        KeywordIndex::in_memory().map_err(|e| SiftError::Corpus(e.to_string()))?,
    ));
    let sparse_index = Arc::new(SparseIndex::new());
    let encoder: Arc<dyn LexicalEncoder> =
        Arc::new(TermWeightEncoder::new().map_err(|e| SiftError::Corpus(e.to_string()))?);
    let store = Arc::new(MemoryDocumentStore::new());

    let mut processor = BatchProcessor::new(
        Arc::clone(&keyword_index),
        Arc::clone(&sparse_index),
        Arc::clone(&encoder),
        Arc::clone(&store),
        config.embedding.batch_size,
    );

    let mut adapters: Vec<Arc<dyn RetrievalAdapter>> = vec![
        Arc::new(FtsAdapter::new(Arc::clone(&keyword_index))),
        Arc::new(SparseAdapter::new(Arc::clone(&encoder), Arc::clone(&sparse_index))),
    ];

    if config
        .retrieval
        .enabled_methods
        .contains(&RetrievalMethod::Dense)
    {
        let model = config.embedding.model.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            FastEmbedProvider::new(&model).map(|p| Arc::new(p) as Arc<dyn EmbeddingProvider>)
        })
        .await
        .map_err(|e| SiftError::Other(e.into()))?;

        processor = register_dense(loaded, processor, &mut adapters);
    }

    let indexed = processor.process(documents).await?;
    if indexed.failed > 0 {
        tracing::warn!("{} documents could not be indexed", indexed.failed);
    }

    let mut orchestrator = SearchOrchestrator::new(adapters, config.fusion_engine()?)
        .with_documents(store);

    if config.rerank.enabled {
        let cross_encoder = FastEmbedCrossEncoder::new(&config.rerank.model, config.rerank.batch_size)
            .map_err(|e| SiftError::Config(e.to_string()))?;
        let engine = RerankEngine::new(Arc::new(cross_encoder), config.rerank_options());
        orchestrator = orchestrator
            .with_reranker(Arc::new(engine))
            .with_cache(Arc::new(MemoryRerankCache::new()));
    }

    // Assemble the query
    let mut query = Query::new(
        query_text,
        options.limit.unwrap_or(config.retrieval.default_limit),
    );
    for (method, weight) in options.weights {
        query = query.with_weight(method, weight);
    }
    for (key, value) in options.filters {
        query = query.with_filter(key, value);
    }

    let response = orchestrator.search(&query, &config.search_config()).await?;

    if options.json {
        let json = serde_json::to_string_pretty(&response).map_err(|e| SiftError::Json {
            source: e,
            context: "Failed to serialize search response".to_string(),
        })?;
        println!("{}", json);
    } else {
        print_search_response(&response);
    }

    Ok(())
}

/// Wire dense retrieval in when the embedding model loaded. Otherwise the
/// search runs without a dense adapter and reports dense as failed.
fn register_dense(
    loaded: std::result::Result<Arc<dyn EmbeddingProvider>, EmbeddingError>,
    processor: BatchProcessor,
    adapters: &mut Vec<Arc<dyn RetrievalAdapter>>,
) -> BatchProcessor {
    match loaded {
        Ok(provider) => {
            let vector_index = Arc::new(VectorIndex::new(provider.dimension()));
            adapters.push(Arc::new(DenseAdapter::new(
                Arc::clone(&provider),
                Arc::clone(&vector_index),
            )));
            processor.with_dense(provider, vector_index)
        }
        Err(e) => {
            tracing::warn!("Embedding model unavailable, skipping dense retrieval: {}", e);
            processor
        }
    }
}

fn print_search_response(response: &SearchResponse) {
    if response.results.is_empty() {
        println!("No results");
    } else {
        println!("{:>4}  {:<32}  {:>10}  {}", "#", "ID", "SCORE", "METHODS");
        for (i, result) in response.results.iter().enumerate() {
            let methods: Vec<&str> = result
                .contributing_methods
                .iter()
                .map(|m| m.as_str())
                .collect();
            println!(
                "{:>4}  {:<32}  {:>10.4}  {}",
                i + 1,
                result.id,
                result.score,
                methods.join(",")
            );
        }
    }

    println!();
    if response.degraded {
        println!(
            "⚠ Degraded: {} unavailable",
            response.failed_methods.join(", ")
        );
    }
    println!(
        "Reranked: {}  Total: {}ms",
        if response.reranked { "yes" } else { "no" },
        response.timing_ms.get("total").copied().unwrap_or(0)
    );
}

fn cmd_eval(runs: &Path, judgments: &Path, k: usize, per_query: bool, json: bool) -> Result<()> {
    let runs: HashMap<String, Vec<String>> = read_json(runs)?;
    let judgments: Vec<RankingJudgment> = read_json(judgments)?;

    let summary = evaluate_runs(&runs, &judgments, k);

    if json {
        let output = serde_json::to_string_pretty(&summary).map_err(|e| SiftError::Json {
            source: e,
            context: "Failed to serialize evaluation summary".to_string(),
        })?;
        println!("{}", output);
    } else {
        print_summary(&summary, per_query);
    }

    Ok(())
}

fn print_summary(summary: &EvaluationSummary, per_query: bool) {
    println!("Evaluation over {} queries (k = {})", summary.query_count, summary.k);
    println!("==================================");
    println!("  nDCG@{}:      {:.4}", summary.k, summary.mean.ndcg);
    println!("  Recall@{}:    {:.4}", summary.k, summary.mean.recall);
    println!("  Precision@{}: {:.4}", summary.k, summary.mean.precision);
    println!("  MRR:          {:.4}", summary.mean.mrr);

    if per_query {
        println!();
        println!("{:<24}  {:>8}  {:>8}  {:>8}  {:>8}", "QUERY", "NDCG", "RECALL", "PREC", "MRR");
        for (query_id, report) in &summary.per_query {
            println!(
                "{:<24}  {:>8.4}  {:>8.4}  {:>8.4}  {:>8.4}",
                query_id, report.ndcg, report.recall, report.precision, report.mrr
            );
        }
    }
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path, None)?;
            let value = config_value(&config)?;

            let shown = match &section {
                Some(section) => lookup(&value, section).ok_or_else(|| {
                    SiftError::Config(format!("Unknown config section: {}", section))
                })?,
                None => &value,
            };

            println!("{}", to_pretty_json(shown)?);
        }
        ConfigAction::Get { key } => {
            let config = load_config(config_path, None)?;
            let value = config_value(&config)?;
            let found = lookup(&value, &key)
                .ok_or_else(|| SiftError::Config(format!("Unknown config key: {}", key)))?;

            match found {
                serde_json::Value::String(s) => println!("{}", s),
                other => println!("{}", other),
            }
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::debug!(
            "Config file not found at {:?}, using defaults. Run 'sift config init' to create one.",
            path
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        sift::config::ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    if let Some(profile) = profile {
        Config::load_with_profile(&path, &profile)
    } else {
        Config::load(&path)
    }
}

fn load_corpus(path: &Path) -> Result<Vec<Document>> {
    let documents: Vec<Document> = read_json(path)?;
    if documents.iter().any(|d| d.id.is_empty()) {
        return Err(SiftError::Corpus(format!(
            "Corpus {:?} contains a document with an empty id",
            path
        )));
    }
    Ok(documents)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| SiftError::Io {
        source: e,
        context: format!("Failed to read {:?}", path),
    })?;
    serde_json::from_str(&content).map_err(|e| SiftError::Json {
        source: e,
        context: format!("Failed to parse {:?}", path),
    })
}

fn config_value(config: &Config) -> Result<serde_json::Value> {
    serde_json::to_value(config).map_err(|e| SiftError::Json {
        source: e,
        context: "Failed to serialize config".to_string(),
    })
}

fn to_pretty_json(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| SiftError::Json {
        source: e,
        context: "Failed to serialize config".to_string(),
    })
}

/// Walk a dotted key such as "rerank.top_n"
fn lookup<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    key.split('.')
        .try_fold(value, |current, part| current.get(part))
}
