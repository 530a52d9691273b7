//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::retrieval::RetrievalMethod;

#[derive(Parser, Debug)]
#[command(
    name = "sift",
    version,
    author = "neur0map",
    about = "Hybrid search over a document corpus with fusion and cross-encoder reranking",
    long_about = "Sift runs full-text, dense-vector and sparse-vector retrieval concurrently, \
                  combines the ranked lists with weighted Reciprocal Rank Fusion, optionally \
                  re-scores the head of the list with a cross-encoder, and evaluates rankings \
                  with nDCG, Recall@K, Precision@K and MRR."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/sift/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Search a JSON corpus
    Search {
        /// JSON file holding an array of documents ({id, title, body, metadata})
        corpus: PathBuf,

        /// Search query text
        query: String,

        /// Maximum number of results to return
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only run these methods (repeatable: fts, dense, sparse)
        #[arg(short, long = "method", value_name = "METHOD")]
        methods: Vec<RetrievalMethod>,

        /// Fusion weight override, e.g. dense=0.7 (repeatable)
        #[arg(short, long = "weight", value_name = "METHOD=WEIGHT", value_parser = parse_weight)]
        weights: Vec<(RetrievalMethod, f32)>,

        /// Metadata filter, e.g. lang=en (repeatable)
        #[arg(short, long = "filter", value_name = "KEY=VALUE", value_parser = parse_filter)]
        filters: Vec<(String, String)>,

        /// Skip the embedding model and dense retrieval
        #[arg(long)]
        no_dense: bool,

        /// Rerank the fused shortlist with the cross-encoder
        #[arg(long)]
        rerank: bool,

        /// Profile to use (e.g., "fast", "accurate")
        #[arg(short, long)]
        profile: Option<String>,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Score ranked runs against relevance judgments
    Eval {
        /// JSON object mapping query ids to ranked document ids
        runs: PathBuf,

        /// JSON array of judgments ({query_id, grades: {doc_id: grade}})
        judgments: PathBuf,

        /// Cutoff for nDCG, Recall and Precision
        #[arg(short, long, default_value = "10")]
        k: usize,

        /// Show per-query metrics
        #[arg(long)]
        per_query: bool,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Get a configuration value
    Get {
        /// Configuration key in dot notation (e.g., "rerank.top_n")
        key: String,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

fn parse_weight(s: &str) -> Result<(RetrievalMethod, f32), String> {
    let (method, weight) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected METHOD=WEIGHT, got '{}'", s))?;
    let method = method.trim().parse::<RetrievalMethod>()?;
    let weight = weight
        .trim()
        .parse::<f32>()
        .map_err(|e| format!("Invalid weight '{}': {}", weight, e))?;
    Ok((method, weight))
}

fn parse_filter(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("Expected KEY=VALUE, got '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_search() {
        let cli = Cli::try_parse_from([
            "sift", "search", "docs.json", "rust memory", "-m", "fts", "-m", "sparse", "-w",
            "fts=0.3", "-f", "lang=en", "--json",
        ])
        .unwrap();

        match cli.command {
            Commands::Search {
                methods,
                weights,
                filters,
                json,
                ..
            } => {
                assert_eq!(methods, vec![RetrievalMethod::Fts, RetrievalMethod::Sparse]);
                assert_eq!(weights, vec![(RetrievalMethod::Fts, 0.3)]);
                assert_eq!(filters, vec![("lang".to_string(), "en".to_string())]);
                assert!(json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_bad_weight_rejected() {
        assert!(parse_weight("dense").is_err());
        assert!(parse_weight("vector=1.0").is_err());
        assert!(parse_weight("dense=heavy").is_err());
        assert!(parse_filter("=en").is_err());
    }
}
